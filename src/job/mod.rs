//! Warm-up jobs: identity plus a one-way outcome record.

use std::fmt;
use std::time::Duration;

use url::Url;

use crate::session::SessionHandle;

pub mod executor;
pub mod stats;

pub use executor::JobExecutor;
pub use stats::Stats;

/// Lifecycle of a job within one run. `Pending` is the only source state;
/// once a job is `Completed` or `Failed` it never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Completed,
    Failed,
}

/// Why a warm-up request failed. Carried on the job and aggregated into
/// [`Stats`] so operators can tell origin overload apart from
/// configuration problems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailReason {
    /// Connection timed out, server possibly overloaded.
    Timeout,
    /// Transport-level failure other than a timeout.
    Connection,
    /// Origin answered 502, 503 or 504.
    Unavailable,
    /// Status code other than the expected 200/204.
    InvalidCode,
    /// The session used for the request became invalid in the interim.
    SessionExpired,
}

impl FailReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailReason::Timeout => "CONNECTION_TIMEOUT",
            FailReason::Connection => "CONNECTION_FAILURE",
            FailReason::Unavailable => "SITE_NOT_AVAILABLE",
            FailReason::InvalidCode => "INVALID_STATUS_CODE",
            FailReason::SessionExpired => "SESSION_EXPIRED",
        }
    }
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One URL to warm. Identity fields come from the queue row; outcome
/// fields are filled in by the executor and read back by the queue and
/// the stats aggregator.
#[derive(Debug, Clone)]
pub struct Job {
    id: i64,
    url: Url,
    entity_id: i64,
    entity_type: String,
    /// `None` means the anonymous/public variant of the page.
    customer_group: Option<String>,

    status: JobStatus,
    status_code: Option<u16>,
    fail_reason: Option<FailReason>,
    transfer_time: Option<Duration>,
    already_warm: bool,
    /// Session used for the last attempt. Never persisted; only lives for
    /// the duration of one run.
    session: Option<SessionHandle>,
}

impl Job {
    /// Materialize a job from its queue row fields. Fails if the URL is
    /// relative or has no host.
    pub fn new(
        id: i64,
        url: &str,
        entity_id: i64,
        entity_type: impl Into<String>,
        customer_group: Option<String>,
    ) -> Result<Self, String> {
        let url = Url::parse(url).map_err(|e| format!("unparsable url {url:?}: {e}"))?;

        if url.host_str().is_none() {
            return Err(format!("url {url} has no host"));
        }

        Ok(Self {
            id,
            url,
            entity_id,
            entity_type: entity_type.into(),
            customer_group,
            status: JobStatus::Pending,
            status_code: None,
            fail_reason: None,
            transfer_time: None,
            already_warm: false,
            session: None,
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn entity_id(&self) -> i64 {
        self.entity_id
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn customer_group(&self) -> Option<&str> {
        self.customer_group.as_deref()
    }

    /// Host, including the port when it is not the scheme default.
    /// Sessions are keyed by this value.
    pub fn url_host(&self) -> String {
        // Host presence is checked in the constructor.
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    pub fn url_scheme(&self) -> &str {
        self.url.scheme()
    }

    /// Path plus query string, if any.
    pub fn url_location(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_string(),
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn is_pending(&self) -> bool {
        self.status == JobStatus::Pending
    }

    pub fn is_completed(&self) -> bool {
        self.status == JobStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.status == JobStatus::Failed
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    pub fn fail_reason(&self) -> Option<FailReason> {
        self.fail_reason
    }

    pub fn transfer_time(&self) -> Option<Duration> {
        self.transfer_time
    }

    /// Whether the origin reported a cache hit for this job.
    pub fn was_already_warm(&self) -> bool {
        self.already_warm
    }

    pub fn session(&self) -> Option<&SessionHandle> {
        self.session.as_ref()
    }

    /// Remember the session used for this attempt.
    pub fn attach_session(&mut self, session: SessionHandle) {
        self.session = Some(session);
    }

    /// Record the time-to-first-byte measured for this job's request.
    pub fn set_transfer_time(&mut self, elapsed: Duration) {
        if self.is_pending() {
            self.transfer_time = Some(elapsed);
        }
    }

    /// Settle the job as completed. Ignored for already-settled jobs.
    pub fn mark_completed(&mut self, status_code: u16, already_warm: bool) {
        if !self.is_pending() {
            return;
        }

        self.status = JobStatus::Completed;
        self.status_code = Some(status_code);
        self.already_warm = already_warm;
    }

    /// Settle the job as failed. Ignored for already-settled jobs.
    pub fn mark_failed(&mut self, reason: FailReason, status_code: Option<u16>) {
        if !self.is_pending() {
            return;
        }

        self.status = JobStatus::Failed;
        self.fail_reason = Some(reason);
        self.status_code = status_code;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(
            7,
            "https://shop.example.com/gear/jackets?page=2",
            42,
            "category",
            Some("wholesale".to_string()),
        )
        .unwrap()
    }

    #[test]
    fn decomposes_url() {
        let job = job();
        assert_eq!(job.url_host(), "shop.example.com");
        assert_eq!(job.url_scheme(), "https");
        assert_eq!(job.url_location(), "/gear/jackets?page=2");
    }

    #[test]
    fn url_location_without_query() {
        let job = Job::new(1, "http://shop.example.com/sale", 1, "page", None).unwrap();
        assert_eq!(job.url_location(), "/sale");
    }

    #[test]
    fn rejects_relative_url() {
        assert!(Job::new(1, "/gear/jackets", 1, "page", None).is_err());
    }

    #[test]
    fn status_transitions_are_one_way() {
        let mut job = job();
        assert!(job.is_pending());

        job.mark_failed(FailReason::Timeout, None);
        assert!(job.is_failed());
        assert_eq!(job.fail_reason(), Some(FailReason::Timeout));

        // A settled job never changes again.
        job.mark_completed(200, false);
        assert!(job.is_failed());
        assert_eq!(job.status_code(), None);
    }

    #[test]
    fn completed_records_code_and_warm_flag() {
        let mut job = job();
        job.set_transfer_time(Duration::from_millis(120));
        job.mark_completed(204, true);

        assert!(job.is_completed());
        assert_eq!(job.status_code(), Some(204));
        assert!(job.was_already_warm());
        assert_eq!(job.transfer_time(), Some(Duration::from_millis(120)));
    }
}
