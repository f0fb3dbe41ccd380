//! Worker configuration: runtime settings plus an optional TOML overlay.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::http;
use crate::throttler::ThrottlerConfig;

/// Settings for one worker run.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Baseline number of concurrent warm-up requests.
    pub concurrency: usize,
    /// Stop after this many jobs have been processed in one run.
    pub max_jobs: usize,
    /// Keep polling the queue for at least this long before exiting.
    pub min_runtime: Duration,
    /// Sleep between queue polls while the queue is empty.
    pub min_runtime_delay: Duration,
    /// How many jobs to lease from the queue per acquisition.
    pub batch_size: usize,
    /// Timeout for warm-up requests.
    pub warmup_timeout: Duration,
    /// Timeout for login-flow requests.
    pub session_timeout: Duration,
    /// Headers sent with every warm-up request.
    pub warmup_headers: BTreeMap<String, String>,
    /// Where to persist session files. `None` uses a directory under the
    /// system temp dir, shared by all workers on the machine.
    pub session_storage_dir: Option<PathBuf>,
    /// Adaptive throttling, on with defaults unless disabled.
    pub throttle: Throttle,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_jobs: 100,
            min_runtime: Duration::from_secs(10),
            min_runtime_delay: Duration::from_millis(500),
            batch_size: 10,
            warmup_timeout: http::DEFAULT_TIMEOUT,
            session_timeout: http::DEFAULT_TIMEOUT,
            warmup_headers: http::default_warmup_headers(),
            session_storage_dir: None,
            throttle: Throttle::On(ThrottleOverrides::default()),
        }
    }
}

impl WorkerSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.warmup_timeout.is_zero() || self.session_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "timeouts must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Throttler configuration, if throttling is enabled. Unset overrides
    /// fall back to the throttler defaults, except `target_concurrency`
    /// which follows the configured worker concurrency.
    pub fn throttler_config(&self) -> Option<ThrottlerConfig> {
        let overrides = match &self.throttle {
            Throttle::Off => return None,
            Throttle::On(overrides) => overrides,
        };

        let defaults = ThrottlerConfig::default();
        Some(ThrottlerConfig {
            target_ttfb: overrides
                .target_ttfb_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.target_ttfb),
            target_concurrency: overrides.target_concurrency.unwrap_or(self.concurrency),
            slowdown_delay_multiplier: overrides
                .slowdown_delay_multiplier
                .unwrap_or(defaults.slowdown_delay_multiplier),
            fail_delay: overrides
                .fail_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.fail_delay),
        })
    }
}

#[derive(Debug, Clone)]
pub enum Throttle {
    Off,
    On(ThrottleOverrides),
}

/// Per-run overrides for the adaptive throttler.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThrottleOverrides {
    #[serde(default)]
    pub target_ttfb_ms: Option<u64>,
    #[serde(default)]
    pub target_concurrency: Option<usize>,
    #[serde(default)]
    pub slowdown_delay_multiplier: Option<f64>,
    #[serde(default)]
    pub fail_delay_ms: Option<u64>,
}

/// Configuration file structure. Every field is optional; set fields
/// override the built-in defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub max_jobs: Option<usize>,
    #[serde(default)]
    pub min_runtime_secs: Option<u64>,
    #[serde(default)]
    pub min_runtime_delay_ms: Option<u64>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub warmup_timeout_secs: Option<u64>,
    #[serde(default)]
    pub session_timeout_secs: Option<u64>,
    /// Replaces the default warm-up header set entirely when present.
    #[serde(default)]
    pub warmup_headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub session_storage_dir: Option<PathBuf>,
    #[serde(default)]
    pub throttle: Option<bool>,
    #[serde(default)]
    pub throttling: Option<ThrottleOverrides>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply set fields onto `settings`.
    pub fn apply_to(&self, settings: &mut WorkerSettings) {
        if let Some(concurrency) = self.concurrency {
            settings.concurrency = concurrency;
        }
        if let Some(max_jobs) = self.max_jobs {
            settings.max_jobs = max_jobs;
        }
        if let Some(secs) = self.min_runtime_secs {
            settings.min_runtime = Duration::from_secs(secs);
        }
        if let Some(ms) = self.min_runtime_delay_ms {
            settings.min_runtime_delay = Duration::from_millis(ms);
        }
        if let Some(batch_size) = self.batch_size {
            settings.batch_size = batch_size;
        }
        if let Some(secs) = self.warmup_timeout_secs {
            settings.warmup_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.session_timeout_secs {
            settings.session_timeout = Duration::from_secs(secs);
        }
        if let Some(ref headers) = self.warmup_headers {
            settings.warmup_headers = headers.clone();
        }
        if let Some(ref dir) = self.session_storage_dir {
            settings.session_storage_dir = Some(dir.clone());
        }
        // `throttle = true` without a [throttling] table enables the
        // defaults; a [throttling] table implies enablement unless
        // `throttle = false` is set explicitly.
        match (self.throttle, &self.throttling) {
            (Some(false), _) => settings.throttle = Throttle::Off,
            (Some(true), overrides) => {
                settings.throttle = Throttle::On(overrides.clone().unwrap_or_default());
            }
            (None, Some(overrides)) => {
                settings.throttle = Throttle::On(overrides.clone());
            }
            (None, None) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = WorkerSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.concurrency, 1);
        assert_eq!(settings.max_jobs, 100);
        assert_eq!(settings.batch_size, 10);
        assert_eq!(settings.min_runtime, Duration::from_secs(10));
        assert_eq!(settings.min_runtime_delay, Duration::from_millis(500));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let settings = WorkerSettings {
            concurrency: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn throttler_config_follows_worker_concurrency() {
        let settings = WorkerSettings {
            concurrency: 4,
            throttle: Throttle::On(ThrottleOverrides::default()),
            ..Default::default()
        };
        let config = settings.throttler_config().unwrap();
        assert_eq!(config.target_concurrency, 4);
        assert_eq!(config.target_ttfb, Duration::from_secs(10));
    }

    #[test]
    fn throttling_is_on_by_default() {
        let config = WorkerSettings::default().throttler_config().unwrap();
        assert_eq!(config.target_concurrency, 1);
        assert_eq!(config.fail_delay, Duration::from_secs(10));
    }

    #[test]
    fn config_file_overlays_settings() {
        let file: ConfigFile = toml::from_str(
            r#"
            concurrency = 8
            max_jobs = 250
            min_runtime_secs = 30
            warmup_timeout_secs = 5

            [warmup_headers]
            "X-Warmup" = "yes"

            [throttling]
            target_ttfb_ms = 2000
            fail_delay_ms = 1500
            "#,
        )
        .unwrap();

        let mut settings = WorkerSettings::default();
        file.apply_to(&mut settings);

        assert_eq!(settings.concurrency, 8);
        assert_eq!(settings.max_jobs, 250);
        assert_eq!(settings.min_runtime, Duration::from_secs(30));
        assert_eq!(settings.warmup_timeout, Duration::from_secs(5));
        assert_eq!(settings.warmup_headers.len(), 1);

        let throttler = settings.throttler_config().unwrap();
        assert_eq!(throttler.target_ttfb, Duration::from_secs(2));
        assert_eq!(throttler.fail_delay, Duration::from_millis(1500));
        assert_eq!(throttler.target_concurrency, 8);
    }

    #[test]
    fn explicit_throttle_false_wins_over_overrides() {
        let file: ConfigFile = toml::from_str(
            r#"
            throttle = false

            [throttling]
            target_ttfb_ms = 2000
            "#,
        )
        .unwrap();

        let mut settings = WorkerSettings::default();
        file.apply_to(&mut settings);
        assert!(settings.throttler_config().is_none());
    }
}
