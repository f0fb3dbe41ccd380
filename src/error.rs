//! Error taxonomy for the warm-up worker.
//!
//! Per-job transient failures (timeouts, bad status codes) are never
//! surfaced as errors; they are recorded on the `Job` itself so the queue
//! lease mechanism can retry them. The types here cover everything that
//! is fatal to a run: queue transaction failures, session establishment
//! failures and configuration problems.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by queue implementations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A row that cannot be materialized into a `Job` (e.g. unparsable URL).
    #[error("invalid queue row {id}: {detail}")]
    InvalidRow { id: i64, detail: String },

    #[error("queue task failed: {0}")]
    Runtime(String),
}

/// Errors raised while establishing or persisting sessions.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session storage I/O at {path}: {source}")]
    Storage {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("login request to {host} failed: {source}")]
    Transport {
        host: String,
        source: reqwest::Error,
    },

    #[error("could not open login page for host {host}: status {status}")]
    LoginPageUnavailable { host: String, status: u16 },

    #[error("could not find login form key for host {host}")]
    FormKeyNotFound { host: String },

    #[error("too many redirects during login for host {host}")]
    TooManyRedirects { host: String },

    #[error("cannot build login URL for host {host}")]
    InvalidHost { host: String },

    #[error("authentication failed for host {host}, customer group {customer_group}: {detail}")]
    AuthenticationFailed {
        host: String,
        customer_group: String,
        detail: String,
    },

    #[error("no credentials configured for customer group {0}")]
    UnknownCustomerGroup(String),
}

/// Errors raised by the batch executor. Per-request failures are recorded
/// on jobs instead; only session establishment aborts a batch.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Configuration problems, fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Top-level error for a worker run.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}
