//! Retry with backoff
//!
//! [`RetryPolicy`] is the immutable retry configuration. [`execute_with_retry`]
//! runs an operation under it with no circuit breaker; [`crate::run`] adds one.
//!
//! # Delay schedule
//!
//! The delay before retry `n + 1` is computed from the attempt `n` that just
//! failed (1-based):
//!
//! | Backoff | Delay before jitter |
//! |---------|---------------------|
//! | `Exponential` | `min(max_delay, base_delay * 2^(n-1))` |
//! | `Linear` | `min(max_delay, base_delay * n)` |
//! | `Fixed` | `base_delay` |
//!
//! Jitter then scales the delay by a uniform factor in
//! `[1 - jitter_fraction, 1 + jitter_fraction]`.
//!
//! # Example
//!
//! ```rust,ignore
//! use lexguard::{execute_with_retry, RetryPolicy, BackoffKind};
//!
//! let policy = RetryPolicy::default()
//!     .with_max_attempts(4)
//!     .with_backoff(BackoffKind::Linear);
//!
//! let rows = execute_with_retry(|| async { warehouse.query(&sql).await }, &policy).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ExecutionError;
use crate::executor;
use crate::operation::Operation;

/// How the base delay grows between retries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Exponential,
    Linear,
    Fixed,
}

/// Immutable retry configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay unit the backoff schedule is built from
    pub base_delay: Duration,
    /// Cap applied to exponential and linear delays
    pub max_delay: Duration,
    /// Total attempts including the first one (at least 1)
    pub max_attempts: u32,
    /// Jitter fraction (0.0 to 1.0)
    pub jitter_fraction: f64,
    pub backoff_kind: BackoffKind,
    /// Deadline for each individual attempt
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 3,
            jitter_fraction: 0.1,
            backoff_kind: BackoffKind::Exponential,
            attempt_timeout: None,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn no_retry() -> Self {
        Self::default().with_max_attempts(1)
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set jitter fraction (clamped to 0.0..=1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter_fraction = if jitter.is_nan() {
            0.0
        } else {
            jitter.clamp(0.0, 1.0)
        };
        self
    }

    pub fn with_backoff(mut self, kind: BackoffKind) -> Self {
        self.backoff_kind = kind;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Delay before jitter, following the failed 1-based `attempt`
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self.backoff_kind {
            BackoffKind::Fixed => self.base_delay,
            BackoffKind::Linear => self
                .base_delay
                .checked_mul(attempt)
                .unwrap_or(self.max_delay)
                .min(self.max_delay),
            BackoffKind::Exponential => {
                // shifts past 31 bits saturate; the cap applies either way
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay
                    .checked_mul(factor)
                    .unwrap_or(self.max_delay)
                    .min(self.max_delay)
            }
        }
    }

    /// Delay to sleep after the failed 1-based `attempt`, jitter included
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.jittered(self.base_delay_for(attempt), &mut rand::thread_rng())
    }

    /// Scale `delay` by a uniform factor in `[1 - jitter, 1 + jitter]`
    pub fn jittered<R: Rng + ?Sized>(&self, delay: Duration, rng: &mut R) -> Duration {
        if self.jitter_fraction <= 0.0 || delay.is_zero() {
            return delay;
        }
        let offset = rng.gen_range(-1.0..=1.0) * self.jitter_fraction;
        // saturates instead of panicking when the scaled delay overflows
        Duration::try_from_secs_f64(delay.as_secs_f64() * (1.0 + offset).max(0.0))
            .unwrap_or(Duration::MAX)
    }
}

/// Run `operation` with retries and no circuit breaker.
///
/// Non-recoverable failures end the call on the spot; recoverable ones are
/// retried until `max_attempts` and then returned as the full history.
pub async fn execute_with_retry<O: Operation>(
    operation: O,
    policy: &RetryPolicy,
) -> Result<O::Output, ExecutionError> {
    executor::drive(operation, policy, None, None, "unguarded")
        .await
        .result
}
