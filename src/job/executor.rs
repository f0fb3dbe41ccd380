//! Concurrent batch execution of warm-up requests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use reqwest::header::COOKIE;
use reqwest::Client;
use tracing::{debug, trace};

use super::{FailReason, Job};
use crate::error::ExecutorError;
use crate::session::SessionManager;

/// Response header the cache layer uses to report hit/miss.
pub const CACHE_STATUS_HEADER: &str = "X-Magento-Cache-Debug";

/// Dispatches jobs as warm-up GET requests in bounded-concurrency
/// batches and classifies each outcome onto its job.
///
/// Requests within a batch run concurrently and the executor waits for
/// every one to settle before starting the next batch; no request ever
/// outlives its batch.
pub struct JobExecutor {
    sessions: Arc<SessionManager>,
    client: Client,
}

impl JobExecutor {
    /// `client` is expected to carry the warm-up headers and have
    /// redirects disabled (see [`crate::http::warmup_client`]).
    pub fn new(sessions: Arc<SessionManager>, client: Client) -> Self {
        Self { sessions, client }
    }

    /// Execute `jobs` with a fan-out of `concurrency` requests at a time
    /// and `delay` of pacing per request.
    ///
    /// The delay is applied between batches, scaled by the batch width,
    /// so the aggregate request rate is the same regardless of
    /// concurrency. A session-establishment failure settles the current
    /// batch, leaves the affected jobs pending and aborts execution.
    pub async fn execute(
        &self,
        jobs: &mut [Job],
        concurrency: usize,
        delay: Duration,
    ) -> Result<(), ExecutorError> {
        let concurrency = concurrency.max(1);
        let mut first_error: Option<ExecutorError> = None;

        for (batch_nr, batch) in jobs.chunks_mut(concurrency).enumerate() {
            if batch_nr > 0 && !delay.is_zero() {
                tokio::time::sleep(delay * concurrency as u32).await;
            }

            trace!(batch_nr, width = batch.len(), "dispatching warm-up batch");

            let results = join_all(batch.iter_mut().map(|job| self.warm(job))).await;

            for result in results {
                if let Err(error) = result {
                    first_error.get_or_insert(error);
                }
            }

            // No session means no valid request can be made; stop here
            // and let the lease mechanism retry the untouched jobs.
            if let Some(error) = first_error.take() {
                return Err(error);
            }
        }

        Ok(())
    }

    async fn warm(&self, job: &mut Job) -> Result<(), ExecutorError> {
        let host = job.url_host();
        let session = self
            .sessions
            .get_session(job.url_scheme(), &host, job.customer_group(), false)
            .await?;
        job.attach_session(session.clone());

        let cookie_header = session.read().await.cookie_header(Utc::now());

        let mut request = self.client.get(job.url().clone());
        if let Some(header) = cookie_header {
            request = request.header(COOKIE, header);
        }

        let started = Instant::now();
        let response = match request.send().await {
            Ok(response) => response,
            Err(error) if error.is_timeout() => {
                debug!(job = job.id(), "warm-up request timed out");
                job.mark_failed(FailReason::Timeout, None);
                return Ok(());
            }
            Err(error) => {
                debug!(job = job.id(), %error, "warm-up request failed");
                job.mark_failed(FailReason::Connection, None);
                return Ok(());
            }
        };

        // Headers have arrived, the body is never read: this is the
        // time-to-first-byte.
        let ttfb = started.elapsed();
        let status = response.status().as_u16();

        match status {
            200 | 204 => {
                if !session.read().await.is_valid(Utc::now()) {
                    // The session stopped being valid while the request
                    // was in flight; the response may be the wrong
                    // variant.
                    job.mark_failed(FailReason::SessionExpired, Some(status));
                    return Ok(());
                }

                let already_warm = response
                    .headers()
                    .get(CACHE_STATUS_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .map(|value| value.eq_ignore_ascii_case("HIT"))
                    .unwrap_or(false);

                job.set_transfer_time(ttfb);
                job.mark_completed(status, already_warm);
            }
            502 | 503 | 504 => job.mark_failed(FailReason::Unavailable, Some(status)),
            _ => job.mark_failed(FailReason::InvalidCode, Some(status)),
        }

        Ok(())
    }
}
