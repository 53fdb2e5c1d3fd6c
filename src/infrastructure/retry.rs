//! Retry/backoff policy shared by every fetch call site
//!
//! One policy object parameterized by attempt count and delay range,
//! applied uniformly by the fetch client instead of per-call-site sleep
//! loops.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        use crate::domain::constants::crawling;
        Self {
            max_attempts: crawling::DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(crawling::DEFAULT_RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(crawling::DEFAULT_RETRY_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Delay before retrying after the given 1-based failed attempt:
    /// exponential in the attempt number with random jitter, capped at
    /// `max_delay`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base_ms = self.base_delay.as_millis() as u64;
        let exponential = base_ms.saturating_mul(1u64 << exponent);
        let jitter = fastrand::u64(0..=base_ms / 2);
        Duration::from_millis((exponential + jitter).min(self.max_delay.as_millis() as u64))
    }

    /// Whether another attempt is allowed after `attempt` failures
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
