//! Durable, lease-based job queue.

use async_trait::async_trait;

use crate::error::QueueError;
use crate::job::Job;

pub mod database;

pub use database::{DatabaseQueue, NewJob};

/// Capability interface over the queue storage. The contract is
/// at-least-once: acquisition stamps a lease timestamp, completion
/// deletes the row, and anything else becomes eligible again once the
/// lease expires.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Atomically lease up to `count` eligible jobs, stamping their
    /// processing start time so concurrent acquirers skip them.
    async fn acquire(&self, count: usize) -> Result<Vec<Job>, QueueError>;

    /// Record batch outcomes: rows of `Completed` jobs are deleted;
    /// `Pending` and `Failed` jobs are left untouched so their lease
    /// expiry makes them eligible for retry.
    async fn update_status(&self, jobs: &[Job]) -> Result<(), QueueError>;
}
