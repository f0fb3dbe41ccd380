//! Bulk HTTP cache warm-up crawl worker.
//!
//! Leases URLs from a shared SQLite queue, fetches each one through the
//! caching layer (optionally logged in as a customer-group warm-up
//! account so group-specific page variants get cached too) and reports
//! outcomes back so unfinished work is retried. An adaptive throttler
//! keeps the crawl from overloading the origin.

pub mod config;
pub mod error;
pub mod http;
pub mod job;
pub mod queue;
pub mod session;
pub mod throttler;
pub mod worker;

pub use config::{ConfigFile, Throttle, ThrottleOverrides, WorkerSettings};
pub use error::{ConfigError, ExecutorError, QueueError, SessionError, WorkerError};
pub use job::{FailReason, Job, JobExecutor, JobStatus, Stats};
pub use queue::{DatabaseQueue, NewJob, Queue};
pub use session::{
    Credentials, CredentialsProvider, PreconfiguredCredentialsProvider, Session, SessionManager,
    SessionStore,
};
pub use throttler::{Throttler, ThrottlerConfig, TransferTimeThrottler};
pub use worker::Worker;
