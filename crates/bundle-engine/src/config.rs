//! Engine configuration.

use crate::platform::Platform;
use ed25519_dalek::VerifyingKey;
use reqwest::Url;
use std::path::PathBuf;
use std::time::Duration;

/// Exponential backoff schedule for retryable failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (zero-based): the initial delay
    /// scaled by the multiplier, capped at the maximum.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let scaled =
            self.initial_delay.as_secs_f64() * self.multiplier.powi(retry.min(63) as i32);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }
}

/// Everything the engine needs to know about one bundle installation.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory for application data.
    pub app_data_dir: PathBuf,
    /// Appended to `app_data_dir` to form the bundle directory; may be empty.
    pub bundle_subdirectory: String,
    /// Server base URL (`http(s)://` or `file://`).
    pub base_url: Url,
    /// Ed25519 key the manifest signature must verify against.
    pub public_key: VerifyingKey,
    /// Version of the running shell, compared against `minShellVersion`.
    pub shell_version: u32,
    /// Platform the bundle is materialized for.
    pub platform: Platform,
    /// Pause between background update checks.
    pub check_interval: Duration,
    pub retry: RetryPolicy,
}

impl EngineConfig {
    /// Create a config with default interval and retry settings.
    pub fn new(
        app_data_dir: impl Into<PathBuf>,
        base_url: Url,
        public_key: VerifyingKey,
        shell_version: u32,
        platform: Platform,
    ) -> Self {
        EngineConfig {
            app_data_dir: app_data_dir.into(),
            bundle_subdirectory: String::new(),
            base_url,
            public_key,
            shell_version,
            platform,
            check_interval: Duration::from_secs(3600),
            retry: RetryPolicy::default(),
        }
    }

    /// Set the bundle subdirectory.
    pub fn bundle_subdirectory(mut self, subdirectory: impl Into<String>) -> Self {
        self.bundle_subdirectory = subdirectory.into();
        self
    }

    /// Set the background check interval.
    pub fn check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Set the retry policy.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The directory all bundle state lives under.
    pub fn bundle_dir(&self) -> PathBuf {
        if self.bundle_subdirectory.is_empty() {
            self.app_data_dir.clone()
        } else {
            self.app_data_dir.join(&self.bundle_subdirectory)
        }
    }
}
