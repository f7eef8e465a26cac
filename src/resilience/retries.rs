//! Retry policy.
//!
//! Retries are attempted only for failure kinds listed in `retry_on`, and
//! only while attempts remain. Oracle denials and rate limits cannot be
//! expressed as a `RetryOn` and so are never retried.

use std::time::Duration;

use crate::config::{RetryConfig, RetryOn};
use crate::resilience::backoff::backoff_delay;

/// Static retry configuration shared by every call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    retry_on: Vec<RetryOn>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, retry_on: Vec<RetryOn>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            retry_on,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.retry_on.clone(),
        )
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO, Vec::new())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_retryable(&self, kind: RetryOn) -> bool {
        self.retry_on.contains(&kind)
    }

    /// Backoff before the next attempt, or `None` when `attempt` (1-based,
    /// the attempt that just failed) was the last one allowed.
    pub fn next_delay(&self, attempt: u32, kind: RetryOn) -> Option<Duration> {
        if attempt >= self.max_attempts || !self.is_retryable(kind) {
            return None;
        }
        Some(backoff_delay(attempt, self.base_delay, self.max_delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
