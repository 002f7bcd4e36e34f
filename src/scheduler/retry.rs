//! Retry policy for transient task failures.

use std::time::Duration;

use crate::config::BackoffConfig;
use crate::error::Error;

/// What to do with a task whose attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue after `delay`.
    Retry { delay: Duration },
    /// Transient, but the retry budget is spent.
    Exhausted,
    /// The work itself failed; never retried.
    Fail,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: BackoffConfig,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: BackoffConfig) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Decide for a task that has already been retried `retry_count` times.
    pub fn decide(&self, retry_count: u32, error: &Error) -> RetryDecision {
        if !error.is_transient() {
            return RetryDecision::Fail;
        }
        if retry_count >= self.max_retries {
            return RetryDecision::Exhausted;
        }
        RetryDecision::Retry {
            delay: self.backoff.delay(retry_count),
        }
    }
}
