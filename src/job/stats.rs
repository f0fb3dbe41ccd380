//! Batch and run outcome aggregation.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use super::{FailReason, Job};

/// Sum and count of transfer times, so averages can be merged.
#[derive(Debug, Default, Clone, Copy)]
struct TimeAccumulator {
    sum: Duration,
    count: u64,
}

impl TimeAccumulator {
    fn record(&mut self, elapsed: Duration) {
        self.sum += elapsed;
        self.count += 1;
    }

    fn merge(&mut self, other: &TimeAccumulator) {
        self.sum += other.sum;
        self.count += other.count;
    }

    fn average(&self) -> Option<Duration> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as u32)
        }
    }
}

/// Aggregated outcomes of a set of jobs.
///
/// Two instances combine associatively via [`Stats::add`], so per-batch
/// stats can be folded into a running total without re-walking all jobs.
/// The cache-miss transfer accumulator is the throttling signal: cache
/// hits return near-instantly and would mask real origin load.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    total: u64,
    pending: u64,
    completed: u64,
    failed: u64,
    already_warm: u64,
    fail_reasons: HashMap<FailReason, u64>,
    status_codes: BTreeMap<u16, u64>,
    transfer: TimeAccumulator,
    cache_miss_transfer: TimeAccumulator,
    started: Option<Instant>,
    elapsed: Option<Duration>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_jobs(jobs: &[Job]) -> Self {
        let mut stats = Self::default();
        for job in jobs {
            stats.add_for_job(job);
        }
        stats
    }

    pub fn add_for_job(&mut self, job: &Job) {
        self.total += 1;

        if job.is_completed() {
            self.completed += 1;

            if job.was_already_warm() {
                self.already_warm += 1;
            } else if let Some(elapsed) = job.transfer_time() {
                self.cache_miss_transfer.record(elapsed);
            }
        } else if job.is_failed() {
            self.failed += 1;

            if let Some(reason) = job.fail_reason() {
                *self.fail_reasons.entry(reason).or_insert(0) += 1;
            }
        } else {
            self.pending += 1;
        }

        if let Some(code) = job.status_code() {
            *self.status_codes.entry(code).or_insert(0) += 1;
        }

        if let Some(elapsed) = job.transfer_time() {
            self.transfer.record(elapsed);
        }
    }

    /// Merge another stats instance into this one. Timers are not merged;
    /// each instance keeps its own wall clock.
    pub fn add(&mut self, other: &Stats) {
        self.total += other.total;
        self.pending += other.pending;
        self.completed += other.completed;
        self.failed += other.failed;
        self.already_warm += other.already_warm;

        for (reason, count) in &other.fail_reasons {
            *self.fail_reasons.entry(*reason).or_insert(0) += count;
        }

        for (code, count) in &other.status_codes {
            *self.status_codes.entry(*code).or_insert(0) += count;
        }

        self.transfer.merge(&other.transfer);
        self.cache_miss_transfer.merge(&other.cache_miss_transfer);
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn pending(&self) -> u64 {
        self.pending
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    pub fn already_warm(&self) -> u64 {
        self.already_warm
    }

    pub fn fail_reason_count(&self, reason: FailReason) -> u64 {
        self.fail_reasons.get(&reason).copied().unwrap_or(0)
    }

    pub fn status_code_count(&self, code: u16) -> u64 {
        self.status_codes.get(&code).copied().unwrap_or(0)
    }

    /// Average transfer time over all responded requests.
    pub fn average_transfer_time(&self) -> Option<Duration> {
        self.transfer.average()
    }

    /// Average transfer time over successful cache-miss requests only.
    pub fn average_cache_miss_transfer_time(&self) -> Option<Duration> {
        self.cache_miss_transfer.average()
    }

    pub fn start_timer(&mut self) {
        self.started = Some(Instant::now());
        self.elapsed = None;
    }

    pub fn stop_timer(&mut self) {
        if let Some(started) = self.started {
            self.elapsed = Some(started.elapsed());
        }
    }

    /// Wall-clock duration since `start_timer`, frozen by `stop_timer`.
    pub fn duration(&self) -> Duration {
        match (self.elapsed, self.started) {
            (Some(elapsed), _) => elapsed,
            (None, Some(started)) => started.elapsed(),
            (None, None) => Duration::ZERO,
        }
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total: {}, pending: {}, completed: {}, failed: {}, already warm: {}",
            self.total, self.pending, self.completed, self.failed, self.already_warm
        )?;

        if !self.fail_reasons.is_empty() {
            let mut reasons: Vec<_> = self
                .fail_reasons
                .iter()
                .map(|(r, c)| format!("{r}: {c}"))
                .collect();
            reasons.sort();
            write!(f, "; fail reasons - {}", reasons.join(", "))?;
        }

        if !self.status_codes.is_empty() {
            let codes: Vec<_> = self
                .status_codes
                .iter()
                .map(|(code, c)| format!("{code}: {c}"))
                .collect();
            write!(f, "; status codes - {}", codes.join(", "))?;
        }

        Ok(())
    }
}
