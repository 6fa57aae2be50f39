//! Bounded retry policy for infrastructure failures

use std::time::Duration;

use serde::Deserialize;

/// Retry and backoff settings shared by the worker pool and the reaper.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetryConfig {
    /// How many times a transient infrastructure failure is retried before
    /// the submission is reported as an infrastructure error
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff in seconds, doubled on every attempt
    #[serde(default = "default_backoff")]
    pub backoff: f64,

    /// Upper bound on a single backoff in seconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff: f64,

    /// How many times the reaper tries to tear down a leaked unit or workspace
    #[serde(default = "default_reaper_attempts")]
    pub reaper_attempts: u32,
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.min(30) as i32);
        let secs = (self.backoff * factor).min(self.max_backoff).max(0.0);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Policy that never waits, for tests
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: 0.0,
            max_backoff: 0.0,
            reaper_attempts: max_retries + 1,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff: default_backoff(),
            max_backoff: default_max_backoff(),
            reaper_attempts: default_reaper_attempts(),
        }
    }
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff() -> f64 {
    0.25
}

fn default_max_backoff() -> f64 {
    5.0
}

fn default_reaper_attempts() -> u32 {
    8
}
