//! Bounded retry with randomized delay.
//!
//! Attempts are numbered from 1. Before every attempt after the first the
//! caller sleeps a uniform random delay in `[0, delay_ms)`, which spreads
//! replicas that lost the same conflict apart instead of colliding again.

use std::{thread, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{CommitError, Result};

/// Retry policy for retryable commit conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryController {
    /// Total number of attempts, including the first.
    pub max_retries: u32,
    /// Upper bound of the random sleep between attempts.
    pub delay_ms: u64,
}

impl Default for RetryController {
    fn default() -> Self {
        Self {
            max_retries: 10,
            delay_ms: 1000,
        }
    }
}

impl RetryController {
    pub fn new(max_retries: u32, delay_ms: u64) -> Self {
        Self {
            max_retries: max_retries.max(1),
            delay_ms,
        }
    }

    /// Delay to wait before `attempt`. Zero for the first attempt.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 || self.delay_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::random_range(0..self.delay_ms))
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Sleep before `attempt`.
    pub fn pause(&self, attempt: u32) {
        let delay = self.backoff_for_attempt(attempt);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned unchanged.
    pub fn run<T>(&self, mut op: impl FnMut(u32) -> Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            self.pause(attempt);
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && self.should_retry(attempt) => {
                    tracing::debug!(
                        attempt,
                        max_retries = self.max_retries,
                        error = %err,
                        "Retrying after conflict"
                    );
                    attempt += 1;
                },
                Err(err) => {
                    if err.is_retryable() {
                        tracing::warn!(attempts = attempt, error = %err, "Retry budget exhausted");
                    }
                    return Err(err);
                },
            }
        }
    }
}

/// Wrap `last` as [`CommitError::RetriesExhausted`].
pub fn exhausted(attempts: u32, last: CommitError) -> CommitError {
    CommitError::RetriesExhausted {
        attempts,
        last: Box::new(last),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{transaction::RecordId, tx_id::RequestId};

    fn timeout() -> CommitError {
        CommitError::LockTimeout {
            key: "#9:1".into(),
            holder: RequestId::new(2, 1),
            waited_ms: 1,
        }
    }

    #[test]
    fn test_first_attempt_has_no_delay() {
        let retry = RetryController::new(3, 1000);
        assert_eq!(retry.backoff_for_attempt(1), Duration::ZERO);
        for attempt in 2..20 {
            assert!(retry.backoff_for_attempt(attempt) < Duration::from_millis(1000));
        }
    }

    #[test]
    fn test_zero_delay_never_sleeps() {
        let retry = RetryController::new(3, 0);
        assert_eq!(retry.backoff_for_attempt(5), Duration::ZERO);
    }

    #[test]
    fn test_retries_until_success() {
        let retry = RetryController::new(5, 1);
        let mut calls = 0;
        let value = retry
            .run(|attempt| {
                calls += 1;
                if attempt < 3 {
                    Err(timeout())
                } else {
                    Ok(attempt)
                }
            })
            .unwrap();
        assert_eq!(value, 3);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_budget_exhaustion_returns_last_conflict() {
        let retry = RetryController::new(3, 1);
        let mut calls = 0;
        let err = retry
            .run::<()>(|_| {
                calls += 1;
                Err(timeout())
            })
            .unwrap_err();
        assert_eq!(calls, 3);
        assert_eq!(err, timeout());
    }

    #[test]
    fn test_fatal_errors_are_not_retried() {
        let retry = RetryController::new(5, 1);
        let mut calls = 0;
        let err = retry
            .run::<()>(|_| {
                calls += 1;
                Err(CommitError::DuplicateKey {
                    index: "idx".into(),
                    key: Some("k".into()),
                    existing: RecordId::new(1, 1),
                    incoming: RecordId::new(1, 2),
                })
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, CommitError::DuplicateKey { .. }));
    }

    #[test]
    fn test_exhausted_wraps_last_error() {
        let err = exhausted(4, timeout());
        assert!(err.to_string().contains("giving up after 4 attempts"));
        assert!(!err.is_retryable());
    }
}
