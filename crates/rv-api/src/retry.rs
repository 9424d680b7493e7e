//! Retry policy
//!
//! A call is a bounded state machine:
//!
//! ```text
//! Attempt ──ok──────────────▶ Succeed
//!    │
//!    ├──retryable──▶ Backoff ──▶ Attempt   (while attempts < budget)
//!    │
//!    └──fatal──────▶ Fail
//! ```
//!
//! Backoff is `base * 2^attempt`, capped, and widened to the server's
//! Retry-After hint when one is present.

use crate::error::ApiError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Unit of the exponential schedule
    pub base_delay: Duration,
    /// Ceiling for the computed delay
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Smallest permitted attempt budget
    pub const MIN_ATTEMPTS: u32 = 3;
    /// Largest permitted attempt budget
    pub const MAX_ATTEMPTS: u32 = 6;

    /// Create a policy with the given attempt budget, clamped to 3..=6
    #[inline]
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.clamp(Self::MIN_ATTEMPTS, Self::MAX_ATTEMPTS),
            ..Self::default()
        }
    }

    /// With a different delay unit
    #[inline]
    #[must_use]
    pub fn with_base_delay(mut self, base: Duration) -> Self {
        self.base_delay = base;
        self
    }

    /// With a different delay ceiling
    #[inline]
    #[must_use]
    pub fn with_max_delay(mut self, max: Duration) -> Self {
        self.max_delay = max;
        self
    }

    /// Delay to wait after the given failed attempt (1-based)
    #[must_use]
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        let computed = self.base_delay.saturating_mul(factor).min(self.max_delay);
        match retry_after {
            Some(hint) if hint > computed => hint,
            _ => computed,
        }
    }

    /// Decide what happens after a failed attempt
    #[must_use]
    pub fn next_step(&self, attempt: u32, error: ApiError) -> RetryStep {
        if !error.is_retryable() {
            return RetryStep::Fail(error.with_attempts(attempt));
        }
        if attempt >= self.max_attempts {
            return RetryStep::Fail(ApiError::exhausted(error, attempt));
        }
        let delay = self.delay_for(attempt, error.retry_after);
        RetryStep::Backoff { delay, error }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Outcome of classifying a failed attempt
#[derive(Debug)]
pub enum RetryStep {
    /// Sleep, then attempt again
    Backoff {
        /// How long to wait
        delay: Duration,
        /// The failure that caused the backoff
        error: ApiError,
    },
    /// Surface the error to the caller
    Fail(ApiError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiErrorKind;

    #[test]
    fn exponential_schedule_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1, None), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2, None), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4, None), Duration::from_secs(16));
        assert_eq!(policy.delay_for(5, None), Duration::from_secs(30));
        assert_eq!(policy.delay_for(40, None), Duration::from_secs(30));
    }

    #[test]
    fn retry_after_widens_but_never_narrows() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(45))),
            Duration::from_secs(45)
        );
        assert_eq!(
            policy.delay_for(3, Some(Duration::from_secs(1))),
            Duration::from_secs(8)
        );
    }

    #[test]
    fn attempt_budget_is_clamped() {
        assert_eq!(RetryPolicy::new(1).max_attempts, 3);
        assert_eq!(RetryPolicy::new(5).max_attempts, 5);
        assert_eq!(RetryPolicy::new(50).max_attempts, 6);
    }

    #[test]
    fn fatal_errors_fail_immediately() {
        let policy = RetryPolicy::default();
        let err = ApiError::from_status("/x", 404, "missing", None);
        match policy.next_step(1, err) {
            RetryStep::Fail(e) => assert_eq!(e.kind, ApiErrorKind::Client),
            RetryStep::Backoff { .. } => panic!("404 must not be retried"),
        }
    }

    #[test]
    fn budget_exhaustion_surfaces_terminal_error() {
        let policy = RetryPolicy::new(3);
        let err = ApiError::from_status("/x", 503, "busy", None);
        assert!(matches!(
            policy.next_step(2, err.clone()),
            RetryStep::Backoff { .. }
        ));
        match policy.next_step(3, err) {
            RetryStep::Fail(e) => {
                assert_eq!(e.kind, ApiErrorKind::Exhausted);
                assert_eq!(e.attempts, 3);
            }
            RetryStep::Backoff { .. } => panic!("budget should be spent"),
        }
    }
}
