//! Adaptive throttling based on measured origin responsiveness.
//!
//! The controller consumes batch statistics and adjusts the suggested
//! request concurrency and inter-request delay for the next batch.
//! Slowdown is addressed by cutting concurrency first; only the
//! remainder that a concurrency cut cannot absorb becomes a time delay.
//! The controller is not sticky: as soon as the origin is back within
//! target, concurrency and delay snap back to their configured baseline.

use std::time::Duration;

use tracing::{debug, warn};

use crate::job::{FailReason, Stats};

/// Throttling strategy interface. Accessors are pure reads; state only
/// changes in `process_batch_stats`.
pub trait Throttler: Send {
    fn process_batch_stats(&mut self, stats: &Stats);

    /// Suggested per-request delay for the next batch.
    fn suggested_request_delay(&self) -> Duration;

    /// Suggested request fan-out width, never below 1.
    fn suggested_concurrency(&self) -> usize;

    /// Non-zero when origin downtime is suspected and work should pause.
    fn suggested_emergency_pause(&self) -> Duration;
}

#[derive(Debug, Clone)]
pub struct ThrottlerConfig {
    /// Average cache-miss TTFB above this value triggers throttling.
    pub target_ttfb: Duration,
    /// Baseline concurrency to run at (and return to) while healthy.
    pub target_concurrency: usize,
    /// Scales the delay computed from unaddressed slowdown.
    pub slowdown_delay_multiplier: f64,
    /// Pause per timed-out or unavailable request in a batch.
    pub fail_delay: Duration,
}

impl Default for ThrottlerConfig {
    fn default() -> Self {
        Self {
            target_ttfb: Duration::from_secs(10),
            target_concurrency: 10,
            slowdown_delay_multiplier: 1.0,
            fail_delay: Duration::from_secs(10),
        }
    }
}

/// Feedback controller driven by the average cache-miss transfer time.
/// Cache hits are excluded from the signal upstream (see `Stats`), since
/// they return near-instantly regardless of origin load.
#[derive(Debug)]
pub struct TransferTimeThrottler {
    config: ThrottlerConfig,
    concurrency: usize,
    request_delay: Duration,
    emergency_pause: Duration,
}

impl TransferTimeThrottler {
    pub fn new(config: ThrottlerConfig) -> Self {
        let concurrency = config.target_concurrency.max(1);
        Self {
            config,
            concurrency,
            request_delay: Duration::ZERO,
            emergency_pause: Duration::ZERO,
        }
    }
}

impl Throttler for TransferTimeThrottler {
    fn process_batch_stats(&mut self, stats: &Stats) {
        // Concurrency and delay only react to an actual latency signal;
        // a batch of pure cache hits or pure failures carries none.
        if let Some(average) = stats.average_cache_miss_transfer_time() {
            let target = self.config.target_ttfb.as_secs_f64();
            let slowdown = average.as_secs_f64() - target;
            let relative_slowdown = slowdown / target;

            if relative_slowdown > 0.0 {
                let suggested = ((self.concurrency as f64 / relative_slowdown.ceil()).floor()
                    as usize)
                    .max(1);
                let relative_decrease =
                    (self.concurrency - suggested) as f64 / self.concurrency as f64;

                if suggested < self.concurrency {
                    warn!(
                        slowdown_pct = (relative_slowdown * 100.0).floor(),
                        concurrency = suggested,
                        "origin slower than target, decreasing concurrency"
                    );
                    self.concurrency = suggested;
                }

                let remaining = relative_slowdown - relative_decrease;

                if remaining > 0.0 {
                    self.request_delay = Duration::from_secs_f64(
                        remaining * target * self.config.slowdown_delay_multiplier,
                    );
                    warn!(
                        delay_secs = self.request_delay.as_secs_f64(),
                        "origin slower than target, adding request delay"
                    );
                }
            } else {
                self.concurrency = self.config.target_concurrency.max(1);
                self.request_delay = Duration::ZERO;
                debug!(
                    speedup_pct = (relative_slowdown.abs() * 100.0).floor(),
                    "origin within target, running at baseline"
                );
            }
        }

        // Emergency pause reacts to hard failures regardless of whether
        // any transfer produced a latency signal.
        let fail_count = stats.fail_reason_count(FailReason::Timeout)
            + stats.fail_reason_count(FailReason::Unavailable);

        if fail_count > 0 {
            self.emergency_pause = self.config.fail_delay * fail_count as u32;
            warn!(
                fails = fail_count,
                pause_secs = self.emergency_pause.as_secs_f64(),
                "hard failures in batch, scheduling emergency pause"
            );
        } else {
            self.emergency_pause = Duration::ZERO;
        }
    }

    fn suggested_request_delay(&self) -> Duration {
        self.request_delay
    }

    fn suggested_concurrency(&self) -> usize {
        self.concurrency.max(1)
    }

    fn suggested_emergency_pause(&self) -> Duration {
        self.emergency_pause
    }
}
