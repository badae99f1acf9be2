//! Retry policy value object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy for transient delivery failures.
///
/// The delay after the `n`-th transient failure is
/// `base * 2^n + rand(0, base)`, capped at `max_delay_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of transient failures after which a row is permanently failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Whether to add `rand(0, base)` jitter to delays.
    #[serde(default = "default_true")]
    pub use_jitter: bool,
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    60_000
}

fn default_max_delay_ms() -> u64 {
    60 * 60 * 1000
}

fn default_true() -> bool {
    true
}

impl RetryPolicy {
    /// Create a new retry policy with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a retry policy with custom max retries.
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Delay before the next attempt, given the retry count after the failure
    /// was recorded.
    pub fn delay_for_attempt(&self, retry_count: u32) -> Duration {
        let base = self.base_delay_ms;
        let exponential = base.saturating_mul(2u64.saturating_pow(retry_count));

        let jitter = if self.use_jitter && base > 0 {
            rand::random::<u64>() % base
        } else {
            0
        };

        Duration::from_millis(exponential.saturating_add(jitter).min(self.max_delay_ms))
    }

    /// Absolute time of the next attempt.
    pub fn next_retry_at(&self, now: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        let delay = self.delay_for_attempt(retry_count);
        now + chrono::Duration::from_std(delay)
            .unwrap_or_else(|_| chrono::Duration::milliseconds(self.max_delay_ms as i64))
    }

    /// Check if more retries are allowed.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            use_jitter: default_true(),
        }
    }
}
