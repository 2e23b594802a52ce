//! Bounded retry with exponential backoff for concurrency conflicts.

use crate::error::{Error, Result};
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How often and how patiently a conflicted operation is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff before attempt `attempt + 1`, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    /// Backoff plus up to 50% random jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        let jitter_ms = (backoff.as_millis() / 2) as u64;
        if jitter_ms == 0 {
            return backoff;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        backoff + Duration::from_millis(jitter)
    }

    /// Whether another attempt is allowed after `attempt` failed.
    pub fn should_retry(&self, attempt: u32, err: &Error) -> bool {
        err.is_retryable() && attempt < self.attempts
    }

    /// Sleep before the next attempt, unless cancelled.
    pub async fn pause(&self, attempt: u32, cancel: &CancellationToken) -> Result<()> {
        let delay = self.delay_for(attempt);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}
