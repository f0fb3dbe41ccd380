//! Command-line entry point for the warm-up worker.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pagewarm::{
    ConfigFile, DatabaseQueue, NewJob, PreconfiguredCredentialsProvider, Throttle, Worker,
    WorkerSettings,
};

#[derive(Parser, Debug)]
#[command(name = "pagewarm", version, about = "Bulk HTTP cache warm-up crawl worker")]
struct Cli {
    /// Path to the queue database, shared between enqueuers and workers.
    #[arg(long, global = true, default_value = "pagewarm.db")]
    database: PathBuf,

    /// Optional TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the queue database and its schema.
    Init,

    /// Add URLs to the warm-up queue.
    Enqueue {
        /// Absolute URLs to warm.
        #[arg(required = true)]
        urls: Vec<String>,

        /// Warm the page variant served to this customer group instead
        /// of the anonymous one.
        #[arg(long)]
        customer_group: Option<String>,

        /// Higher priorities are processed first.
        #[arg(long, default_value_t = 0)]
        priority: i64,

        /// Entity type recorded on the queue rows.
        #[arg(long, default_value = "page")]
        entity_type: String,

        /// Entity id recorded on the queue rows.
        #[arg(long, default_value_t = 0)]
        entity_id: i64,
    },

    /// Process queued jobs until the job budget is spent.
    Work {
        /// Concurrent warm-up requests.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Stop after this many jobs.
        #[arg(long)]
        max_jobs: Option<usize>,

        /// Jobs leased from the queue per acquisition.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Disable adaptive throttling and run at fixed concurrency.
        #[arg(long)]
        no_throttle: bool,

        /// Directory for persisted session files.
        #[arg(long)]
        session_dir: Option<PathBuf>,

        /// Shared password of the warm-up accounts. Only needed when the
        /// queue contains customer-group jobs.
        #[arg(long, env = "PAGEWARM_PASSWORD", default_value = "", hide_env_values = true)]
        password: String,

        /// Domain used when deriving warm-up account usernames.
        #[arg(long, default_value = "pagewarm")]
        account_domain: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            DatabaseQueue::open(&cli.database)
                .with_context(|| format!("cannot initialize queue at {}", cli.database.display()))?;
            println!("queue initialized at {}", cli.database.display());
        }

        Commands::Enqueue {
            urls,
            customer_group,
            priority,
            entity_type,
            entity_id,
        } => {
            let queue = DatabaseQueue::open(&cli.database)
                .with_context(|| format!("cannot open queue at {}", cli.database.display()))?;

            let entries: Vec<NewJob> = urls
                .iter()
                .map(|url| NewJob {
                    url: url.clone(),
                    entity_id,
                    entity_type: entity_type.clone(),
                    customer_group: customer_group.clone(),
                    priority,
                })
                .collect();
            let count = entries.len();

            queue.push(entries).await.context("cannot enqueue jobs")?;
            println!("enqueued {count} job(s)");
        }

        Commands::Work {
            concurrency,
            max_jobs,
            batch_size,
            no_throttle,
            session_dir,
            password,
            account_domain,
        } => {
            let mut settings = WorkerSettings::default();

            if let Some(path) = &cli.config {
                ConfigFile::load(path)?.apply_to(&mut settings);
            }

            // CLI flags win over the config file.
            if let Some(concurrency) = concurrency {
                settings.concurrency = concurrency;
            }
            if let Some(max_jobs) = max_jobs {
                settings.max_jobs = max_jobs;
            }
            if let Some(batch_size) = batch_size {
                settings.batch_size = batch_size;
            }
            if let Some(dir) = session_dir {
                settings.session_storage_dir = Some(dir);
            }
            if no_throttle {
                settings.throttle = Throttle::Off;
            }

            let queue = DatabaseQueue::open(&cli.database)
                .with_context(|| format!("cannot open queue at {}", cli.database.display()))?;
            let credentials = PreconfiguredCredentialsProvider::new(password, account_domain);

            let worker = Worker::new(Arc::new(queue), Arc::new(credentials));
            let stats = worker.run(&settings).await.context("warm-up run failed")?;

            println!("{stats}");
        }
    }

    Ok(())
}
