//! The worker run loop: lease jobs, execute them, report back, repeat.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::WorkerSettings;
use crate::error::WorkerError;
use crate::http;
use crate::job::{JobExecutor, Stats};
use crate::queue::Queue;
use crate::session::{CredentialsProvider, SessionManager, SessionStore};
use crate::throttler::{Throttler, TransferTimeThrottler};

/// Session files land here when no explicit directory is configured.
/// All workers on a machine share it so sessions are reused across runs.
const DEFAULT_SESSION_DIR: &str = "pagewarm-sessions";

/// Processes queued warm-up jobs until either the job budget is spent or
/// the queue stays empty past the minimum runtime.
pub struct Worker {
    queue: Arc<dyn Queue>,
    credentials: Arc<dyn CredentialsProvider>,
}

impl Worker {
    pub fn new(queue: Arc<dyn Queue>, credentials: Arc<dyn CredentialsProvider>) -> Self {
        Self { queue, credentials }
    }

    /// Run to completion and return the aggregated statistics.
    ///
    /// Queue failures and session-establishment failures abort the run;
    /// job outcomes already settled are persisted before the error
    /// propagates, so nothing processed is lost.
    pub async fn run(&self, settings: &WorkerSettings) -> Result<Stats, WorkerError> {
        settings.validate()?;

        let session_dir = settings
            .session_storage_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_SESSION_DIR));
        let sessions = Arc::new(SessionManager::new(
            SessionStore::new(session_dir)?,
            self.credentials.clone(),
            http::session_client(settings.session_timeout)?,
        ));
        let executor = JobExecutor::new(
            sessions,
            http::warmup_client(settings.warmup_timeout, &settings.warmup_headers)?,
        );

        let mut throttler: Option<Box<dyn Throttler>> = settings
            .throttler_config()
            .map(|config| Box::new(TransferTimeThrottler::new(config)) as Box<dyn Throttler>);

        let mut total = Stats::new();
        total.start_timer();

        let started = Instant::now();
        let mut jobs_left = settings.max_jobs;

        info!(
            max_jobs = settings.max_jobs,
            batch_size = settings.batch_size,
            concurrency = settings.concurrency,
            throttled = throttler.is_some(),
            "starting warm-up run"
        );

        loop {
            while jobs_left > 0 {
                let mut jobs = self
                    .queue
                    .acquire(jobs_left.min(settings.batch_size))
                    .await?;

                if jobs.is_empty() {
                    break;
                }

                jobs_left -= jobs.len();

                let (concurrency, delay) = match &throttler {
                    Some(throttler) => (
                        throttler.suggested_concurrency(),
                        throttler.suggested_request_delay(),
                    ),
                    None => (settings.concurrency, Duration::ZERO),
                };

                info!(
                    jobs = jobs.len(),
                    concurrency,
                    delay_ms = delay.as_millis() as u64,
                    "executing batch"
                );

                let outcome = executor.execute(&mut jobs, concurrency, delay).await;

                // Persist whatever settled before deciding whether the
                // batch error is fatal.
                self.queue.update_status(&jobs).await?;

                let batch_stats = Stats::from_jobs(&jobs);
                info!(%batch_stats, "batch finished");
                total.add(&batch_stats);

                if let Some(throttler) = throttler.as_mut() {
                    throttler.process_batch_stats(&batch_stats);

                    let pause = throttler.suggested_emergency_pause();
                    if !pause.is_zero() {
                        warn!(
                            pause_secs = pause.as_secs_f64(),
                            "origin appears unhealthy, pausing"
                        );
                        tokio::time::sleep(pause).await;
                    }
                }

                outcome?;
            }

            // Linger while young so a queue filled moments after our
            // start still gets drained by this process.
            if jobs_left == 0 || started.elapsed() >= settings.min_runtime {
                break;
            }

            tokio::time::sleep(settings.min_runtime_delay).await;
        }

        total.stop_timer();
        info!(%total, "warm-up run finished");

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;
    use crate::http::default_warmup_headers;
    use crate::job::Job;
    use crate::session::PreconfiguredCredentialsProvider;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Queue backed by a Vec, handing out jobs once and recording what
    /// comes back through `update_status`.
    struct MemoryQueue {
        pending: Mutex<Vec<Job>>,
        reported: Mutex<Vec<Job>>,
    }

    impl MemoryQueue {
        fn new(jobs: Vec<Job>) -> Self {
            Self {
                pending: Mutex::new(jobs),
                reported: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Queue for MemoryQueue {
        async fn acquire(&self, count: usize) -> Result<Vec<Job>, QueueError> {
            let mut pending = self.pending.lock().unwrap();
            let take = count.min(pending.len());
            Ok(pending.drain(..take).collect())
        }

        async fn update_status(&self, jobs: &[Job]) -> Result<(), QueueError> {
            self.reported.lock().unwrap().extend_from_slice(jobs);
            Ok(())
        }
    }

    async fn origin() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/customer/account/login/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Set-Cookie", "PHPSESSID=s; Max-Age=3600; Path=/")
                    .set_body_string(
                        r#"<input name="form_key" type="hidden" value="k" />"#,
                    ),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(204).insert_header("X-Magento-Cache-Debug", "MISS"),
            )
            .mount(&server)
            .await;
        server
    }

    fn jobs_for(server: &MockServer, count: i64) -> Vec<Job> {
        (1..=count)
            .map(|id| {
                let url = Url::parse(&server.uri())
                    .unwrap()
                    .join(&format!("/p/{id}"))
                    .unwrap();
                Job::new(id, url.as_str(), id, "product", None).unwrap()
            })
            .collect()
    }

    fn settings(dir: &tempfile::TempDir) -> WorkerSettings {
        WorkerSettings {
            min_runtime: Duration::ZERO,
            session_storage_dir: Some(dir.path().to_path_buf()),
            warmup_headers: default_warmup_headers(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn drains_the_queue_and_reports_every_job() {
        let server = origin().await;
        let queue = Arc::new(MemoryQueue::new(jobs_for(&server, 25)));
        let dir = tempfile::tempdir().unwrap();

        let worker = Worker::new(
            queue.clone(),
            Arc::new(PreconfiguredCredentialsProvider::new("pw", "acme")),
        );
        let stats = worker.run(&settings(&dir)).await.unwrap();

        assert_eq!(stats.total(), 25);
        assert_eq!(stats.completed(), 25);
        assert_eq!(queue.reported.lock().unwrap().len(), 25);
        assert!(queue
            .reported
            .lock()
            .unwrap()
            .iter()
            .all(Job::is_completed));
    }

    #[tokio::test]
    async fn stops_at_the_job_budget() {
        let server = origin().await;
        let queue = Arc::new(MemoryQueue::new(jobs_for(&server, 30)));
        let dir = tempfile::tempdir().unwrap();

        let worker = Worker::new(
            queue.clone(),
            Arc::new(PreconfiguredCredentialsProvider::new("pw", "acme")),
        );
        let mut settings = settings(&dir);
        settings.max_jobs = 12;
        let stats = worker.run(&settings).await.unwrap();

        assert_eq!(stats.total(), 12);
        assert_eq!(queue.pending.lock().unwrap().len(), 18);
    }

    #[tokio::test]
    async fn empty_queue_returns_promptly() {
        let queue = Arc::new(MemoryQueue::new(Vec::new()));
        let dir = tempfile::tempdir().unwrap();

        let worker = Worker::new(
            queue,
            Arc::new(PreconfiguredCredentialsProvider::new("pw", "acme")),
        );
        let stats = worker.run(&settings(&dir)).await.unwrap();

        assert_eq!(stats.total(), 0);
    }

    #[tokio::test]
    async fn invalid_settings_are_rejected_up_front() {
        let queue = Arc::new(MemoryQueue::new(Vec::new()));
        let dir = tempfile::tempdir().unwrap();

        let worker = Worker::new(
            queue,
            Arc::new(PreconfiguredCredentialsProvider::new("pw", "acme")),
        );
        let mut settings = settings(&dir);
        settings.concurrency = 0;
        assert!(worker.run(&settings).await.is_err());
    }
}
