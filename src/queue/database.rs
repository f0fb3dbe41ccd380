//! SQLite-backed queue.
//!
//! The queue forgoes any status column. `processing_started_at IS NULL`
//! marks a fresh job; a non-null stamp older than the retry threshold
//! marks a lease that expired (worker died or the job failed) and the
//! row becomes eligible again; finished rows are deleted outright.
//!
//! `acquire` runs the select-then-stamp sequence inside one immediate
//! transaction so concurrent worker processes never lease the same rows.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, TransactionBehavior};
use tracing::debug;

use super::Queue;
use crate::error::QueueError;
use crate::job::Job;

pub const JOB_TABLE: &str = "cache_warmup_queue";

/// How long a lease lasts before the row is considered abandoned. Must
/// exceed the maximum plausible single-job processing time, or live jobs
/// get double-leased.
pub const DEFAULT_RETRY_THRESHOLD: Duration = Duration::from_secs(20 * 60);

/// A row to enqueue.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub url: String,
    pub entity_id: i64,
    pub entity_type: String,
    pub customer_group: Option<String>,
    pub priority: i64,
}

pub struct DatabaseQueue {
    conn: Arc<Mutex<Connection>>,
    retry_threshold: Duration,
}

impl DatabaseQueue {
    /// Open the queue database, creating the table if needed.
    pub fn open(db_path: &Path) -> Result<Self, QueueError> {
        Self::open_with_retry_threshold(db_path, DEFAULT_RETRY_THRESHOLD)
    }

    pub fn open_with_retry_threshold(
        db_path: &Path,
        retry_threshold: Duration,
    ) -> Result<Self, QueueError> {
        let conn = Connection::open(db_path)?;

        // WAL for concurrent worker processes sharing the database file.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(Duration::from_secs(30))?;

        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {JOB_TABLE} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL,
                entity_id INTEGER NOT NULL,
                entity_type TEXT NOT NULL,
                customer_group TEXT,
                priority INTEGER NOT NULL DEFAULT 0,
                processing_started_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_{JOB_TABLE}_eligibility
                ON {JOB_TABLE}(processing_started_at, priority);
            "#,
        ))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            retry_threshold,
        })
    }

    /// Enqueue new rows. Used by the CLI and by systems feeding the
    /// queue; the worker itself only acquires.
    pub async fn push(&self, entries: Vec<NewJob>) -> Result<(), QueueError> {
        let conn = self.conn.clone();

        run_blocking(move || {
            let mut conn = lock_conn(&conn)?;
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(&format!(
                    "INSERT INTO {JOB_TABLE} (url, entity_id, entity_type, customer_group, priority)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                ))?;
                for entry in &entries {
                    stmt.execute(params![
                        entry.url,
                        entry.entity_id,
                        entry.entity_type,
                        entry.customer_group,
                        entry.priority,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Number of rows currently in the queue, leased or not.
    pub async fn len(&self) -> Result<u64, QueueError> {
        let conn = self.conn.clone();

        run_blocking(move || {
            let conn = lock_conn(&conn)?;
            let count: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {JOB_TABLE}"), [], |row| {
                    row.get(0)
                })?;
            Ok(count as u64)
        })
        .await
    }

    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }
}

#[async_trait]
impl Queue for DatabaseQueue {
    async fn acquire(&self, count: usize) -> Result<Vec<Job>, QueueError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let conn = self.conn.clone();
        let retry_threshold = self.retry_threshold;

        run_blocking(move || {
            let mut conn = lock_conn(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let now = Utc::now();
            let eligibility_cutoff =
                (now - chrono::Duration::from_std(retry_threshold).unwrap_or_default())
                    .timestamp();

            let jobs = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT id, url, entity_id, entity_type, customer_group
                     FROM {JOB_TABLE}
                     WHERE processing_started_at IS NULL OR processing_started_at < ?1
                     ORDER BY priority DESC, id ASC
                     LIMIT ?2",
                ))?;

                let rows = stmt.query_map(params![eligibility_cutoff, count as i64], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                })?;

                let mut jobs = Vec::new();
                for row in rows {
                    let (id, url, entity_id, entity_type, customer_group) = row?;
                    let job = Job::new(id, &url, entity_id, entity_type, customer_group)
                        .map_err(|detail| QueueError::InvalidRow { id, detail })?;
                    jobs.push(job);
                }
                jobs
            };

            if jobs.is_empty() {
                return Ok(jobs);
            }

            tx.execute(
                &format!(
                    "UPDATE {JOB_TABLE} SET processing_started_at = ?1 WHERE id IN ({})",
                    id_list(&jobs)
                ),
                params![now.timestamp()],
            )?;

            tx.commit()?;
            debug!(leased = jobs.len(), "acquired jobs");
            Ok(jobs)
        })
        .await
    }

    async fn update_status(&self, jobs: &[Job]) -> Result<(), QueueError> {
        let completed: Vec<i64> = jobs
            .iter()
            .filter(|job| job.is_completed())
            .map(Job::id)
            .collect();

        if completed.is_empty() {
            return Ok(());
        }

        let conn = self.conn.clone();

        run_blocking(move || {
            let conn = lock_conn(&conn)?;
            let ids = completed
                .iter()
                .map(i64::to_string)
                .collect::<Vec<_>>()
                .join(",");
            let deleted =
                conn.execute(&format!("DELETE FROM {JOB_TABLE} WHERE id IN ({ids})"), [])?;
            debug!(deleted, "removed completed jobs");
            Ok(())
        })
        .await
    }
}

fn id_list(jobs: &[Job]) -> String {
    jobs.iter()
        .map(|job| job.id().to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn lock_conn(
    conn: &Mutex<Connection>,
) -> Result<std::sync::MutexGuard<'_, Connection>, QueueError> {
    conn.lock()
        .map_err(|_| QueueError::Runtime("queue connection mutex poisoned".to_string()))
}

/// Run a blocking rusqlite operation without stalling the async runtime.
async fn run_blocking<F, T>(f: F) -> Result<T, QueueError>
where
    F: FnOnce() -> Result<T, QueueError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| QueueError::Runtime(e.to_string()))?
}
