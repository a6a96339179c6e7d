//! Retry policy for stage attempts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff: attempt `n` waits `backoff_factor ^ n` seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts per stage, including the first try
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base of the exponential delay, in seconds (0 disables waiting)
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Upper bound on a single delay in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_max_delay() -> u64 {
    300_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_factor: f64) -> Self {
        Self {
            max_retries,
            backoff_factor,
            ..Default::default()
        }
    }

    /// Calculate delay after a failed attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.backoff_factor <= 0.0 {
            return Duration::ZERO;
        }

        let millis = self.backoff_factor.powi(attempt as i32) * 1000.0;
        if !millis.is_finite() {
            return Duration::from_millis(self.max_delay_ms);
        }

        Duration::from_millis((millis as u64).min(self.max_delay_ms))
    }

    /// Whether another attempt is allowed after `attempts` tries.
    ///
    /// `limit` is the run's own `max_retries`; a run always gets one attempt.
    pub fn should_retry(&self, attempts: u32, limit: u32) -> bool {
        attempts < limit.max(1)
    }
}
