//! Retry policy for remote calls.
//!
//! Backoff is linear: the wait before re-attempting a record grows with its
//! attempt count. The delay is never slept inside an upload worker — the
//! orchestrator schedules a delayed re-enqueue instead (see `upload`).

use std::time::Duration;

/// Decision for a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Transient failure with attempts remaining: re-enqueue after backoff.
    Retry,
    /// Permanent failure or attempts exhausted: record as failed.
    Abort,
}

/// Linear backoff configuration.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts per record (initial call included).
    pub max_attempts: u32,
    /// Base delay; attempt N waits `base_delay * N` before re-enqueue.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given the number of attempts already
    /// made (1-indexed: after the first failure, `attempts_made` is 1).
    pub fn delay_after(&self, attempts_made: u32) -> Duration {
        self.base_delay.saturating_mul(attempts_made)
    }

    /// Classify a failed attempt.
    pub fn decide(&self, retryable: bool, attempts_made: u32) -> RetryAction {
        if retryable && attempts_made < self.max_attempts {
            RetryAction::Retry
        } else {
            RetryAction::Abort
        }
    }
}
