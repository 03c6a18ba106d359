//! Circuit Breaker Pattern
//!
//! Prevents hammering a failing remote by failing fast while it recovers.
//!
//! # States
//!
//! - **Closed**: Normal operation, calls go through
//! - **Open**: Too many consecutive failures, calls are rejected without invoking the operation
//! - **Half-Open**: Cooldown elapsed, one trial call at a time tests recovery
//!
//! Admission ([`CircuitBreaker::try_acquire`]) and outcome recording each take
//! the breaker's mutex once, so every transition happens in a single critical
//! section and the transition history is linearizable.
//!
//! Admission hands out a [`Permit`]. Dropping a permit without reporting an
//! outcome (the attempt future was dropped, say) frees the half-open trial slot
//! and touches no counters. Permits also carry the breaker generation, bumped on
//! every state change, so outcomes of calls admitted before a transition cannot
//! corrupt the new state.
//!
//! # Example
//!
//! ```rust,ignore
//! use lexguard::{guard, CircuitBreaker, CircuitBreakerConfig};
//!
//! let breaker = CircuitBreaker::new("bq-ml-generate-text", CircuitBreakerConfig::default());
//!
//! let answer = guard(&breaker, || async { call_model().await }).await;
//! ```

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::classify::ErrorRecord;
use crate::error::{CircuitOpenError, GuardError};
use crate::operation::Operation;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - calls flow through
    Closed,
    /// Endpoint failing - calls rejected immediately
    Open,
    /// Testing recovery - one trial call at a time
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time to stay open before admitting a trial call
    pub recovery_timeout: Duration,
    /// Successful trials needed to close from half-open
    pub success_threshold_to_close: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold_to_close: 2,
        }
    }
}

impl CircuitBreakerConfig {
    /// Set failure threshold before circuit opens
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set recovery timeout duration
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// Set success threshold to close circuit from half-open
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold_to_close = threshold.max(1);
        self
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    generation: u64,
    trips: u64,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            opened_at: None,
            trial_in_flight: false,
            generation: 0,
            trips: 0,
        }
    }
}

/// Point-in-time view of a breaker, for reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes_in_half_open: u32,
    /// Milliseconds since the circuit last opened, while open or half-open
    pub opened_ms_ago: Option<u64>,
    /// Times the circuit has opened since creation or last reset
    pub trips: u64,
}

/// Circuit breaker guarding one remote endpoint
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config: CircuitBreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                success_threshold_to_close: config.success_threshold_to_close.max(1),
                ..config
            },
            inner: Mutex::new(Inner::new()),
        }
    }

    /// Create a circuit breaker with default configuration
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Stored state. An expired `Open` only becomes `HalfOpen` on the next admission.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes_in_half_open: inner.half_open_successes,
            opened_ms_ago: match inner.state {
                CircuitState::Closed => None,
                _ => inner
                    .opened_at
                    .map(|at| at.elapsed().as_millis() as u64),
            },
            trips: inner.trips,
        }
    }

    /// Ask to make one call.
    ///
    /// Closed admits everyone. Open rejects until the recovery timeout has
    /// elapsed, then moves to HalfOpen and admits the caller as the trial.
    /// HalfOpen admits a new trial only when no other trial is in flight.
    pub fn try_acquire(&self) -> Result<Permit<'_>, CircuitOpenError> {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => Ok(Permit::new(self, inner.generation, false)),
            CircuitState::Open => {
                let remaining = self.remaining_cooldown(&inner);
                if remaining.is_zero() {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.half_open_successes = 0;
                    inner.trial_in_flight = true;
                    Ok(Permit::new(self, inner.generation, true))
                } else {
                    debug!(breaker = %self.name, retry_after_ms = remaining.as_millis() as u64, "Rejecting call, circuit open");
                    Err(self.rejection(CircuitState::Open, remaining))
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    debug!(breaker = %self.name, "Rejecting call, half-open trial in flight");
                    Err(self.rejection(CircuitState::HalfOpen, Duration::ZERO))
                } else {
                    inner.trial_in_flight = true;
                    Ok(Permit::new(self, inner.generation, true))
                }
            }
        }
    }

    /// Reset the circuit breaker to closed state (for testing/admin purposes)
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Closed);
        inner.consecutive_failures = 0;
        inner.half_open_successes = 0;
        inner.opened_at = None;
        inner.trips = 0;
    }

    /// Force the circuit open (for testing/admin purposes)
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        self.open(&mut inner);
    }

    fn remaining_cooldown(&self, inner: &Inner) -> Duration {
        match inner.opened_at {
            Some(at) => self.config.recovery_timeout.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        }
    }

    fn rejection(&self, state: CircuitState, retry_after: Duration) -> CircuitOpenError {
        CircuitOpenError {
            endpoint: self.name.clone(),
            state,
            retry_after,
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.trial_in_flight = false;

        match to {
            CircuitState::Open => warn!(
                breaker = %self.name,
                from = %from,
                failures = inner.consecutive_failures,
                "Circuit opened"
            ),
            _ => info!(breaker = %self.name, from = %from, to = %to, "Circuit state changed"),
        }
    }

    fn open(&self, inner: &mut Inner) {
        self.transition(inner, CircuitState::Open);
        inner.opened_at = Some(Instant::now());
        inner.half_open_successes = 0;
        inner.trips += 1;
    }

    fn on_success(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if generation != inner.generation {
            debug!(breaker = %self.name, "Ignoring success from a call admitted before the last transition");
            return;
        }

        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.trial_in_flight = false;
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold_to_close {
                    self.transition(&mut inner, CircuitState::Closed);
                    inner.consecutive_failures = 0;
                    inner.half_open_successes = 0;
                    inner.opened_at = None;
                }
            }
            // same-generation permits are never issued while open
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if generation != inner.generation {
            debug!(breaker = %self.name, "Ignoring failure from a call admitted before the last transition");
            return;
        }

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.open(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                inner.consecutive_failures += 1;
                self.open(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    fn release_trial(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if generation == inner.generation && inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("failure_count", &inner.consecutive_failures)
            .finish()
    }
}

/// Admission ticket for one call through a [`CircuitBreaker`]
#[must_use = "report the call outcome with succeed() or fail()"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, generation: u64, trial: bool) -> Self {
        Self {
            breaker,
            generation,
            trial,
            settled: false,
        }
    }

    /// Whether this call is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success(self.generation);
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.generation);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial(self.generation);
        }
    }
}

/// Run one attempt of `operation` through `breaker`.
///
/// While the breaker is open the operation is never invoked.
pub async fn guard<O: Operation>(
    breaker: &CircuitBreaker,
    mut operation: O,
) -> Result<O::Output, GuardError> {
    let permit = breaker.try_acquire()?;

    match operation.invoke().await {
        Ok(value) => {
            permit.succeed();
            Ok(value)
        }
        Err(failure) => {
            permit.fail();
            Err(GuardError::Failed(ErrorRecord::from_failure(&failure, 1)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::RawFailure;

    async fn fail(breaker: &CircuitBreaker) {
        let _ = guard(breaker, || async { Err::<(), _>(RawFailure::status(503, "")) }).await;
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), GuardError> {
        guard(breaker, || async { Ok::<_, RawFailure>(()) }).await
    }

    #[test]
    fn test_circuit_breaker_config_default() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.recovery_timeout, Duration::from_secs(30));
        assert_eq!(config.success_threshold_to_close, 2);
    }

    #[test]
    fn test_circuit_breaker_config_builder() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(3)
            .with_recovery_timeout(Duration::from_secs(10))
            .with_success_threshold(0);

        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.recovery_timeout, Duration::from_secs(10));
        assert_eq!(config.success_threshold_to_close, 1);
    }

    #[test]
    fn test_circuit_breaker_initial_state_closed() {
        let breaker = CircuitBreaker::with_defaults("bq-generate-text");
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_opens_after_threshold_failures() {
        let config = CircuitBreakerConfig::default().with_failure_threshold(3);
        let breaker = CircuitBreaker::new("bq-generate-text", config);

        for _ in 0..2 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.failure_count(), 3);
        assert_eq!(breaker.snapshot().trips, 1);
    }

    #[tokio::test]
    async fn test_fails_fast_without_invoking_when_open() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_recovery_timeout(Duration::from_secs(60));
        let breaker = CircuitBreaker::new("bq-generate-text", config);

        fail(&breaker).await;

        let mut invoked = false;
        let result = guard(&breaker, || {
            invoked = true;
            async { Ok::<_, RawFailure>("should not run") }
        })
        .await;

        assert!(!invoked);
        match result {
            Err(GuardError::Open(rejection)) => {
                assert_eq!(rejection.state, CircuitState::Open);
                assert!(rejection.retry_after > Duration::from_secs(59));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let config = CircuitBreakerConfig::default().with_failure_threshold(3);
        let breaker = CircuitBreaker::new("bq-generate-text", config);

        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.failure_count(), 2);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_after_success_threshold() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_recovery_timeout(Duration::from_secs(30))
            .with_success_threshold(2);
        let breaker = CircuitBreaker::new("bq-generate-text", config);

        fail(&breaker).await;
        tokio::time::advance(Duration::from_secs(30)).await;

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_with_fresh_timestamp() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_recovery_timeout(Duration::from_secs(10));
        let breaker = CircuitBreaker::new("bq-generate-text", config);

        fail(&breaker).await;
        tokio::time::advance(Duration::from_secs(10)).await;

        // trial admitted, then fails
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.snapshot().opened_ms_ago, Some(0));
        assert_eq!(breaker.snapshot().trips, 2);

        // full cooldown applies again
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(breaker.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_trial_in_flight() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_recovery_timeout(Duration::from_secs(5));
        let breaker = CircuitBreaker::new("bq-generate-text", config);
        breaker.force_open();
        tokio::time::advance(Duration::from_secs(5)).await;

        let trial = breaker.try_acquire().expect("trial admitted");
        assert!(trial.is_trial());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let second = breaker.try_acquire();
        assert!(matches!(
            second,
            Err(CircuitOpenError {
                state: CircuitState::HalfOpen,
                ..
            })
        ));

        trial.succeed();
        // trial resolved, next caller may try
        assert!(breaker.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_permit_frees_slot() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_recovery_timeout(Duration::from_secs(1));
        let breaker = CircuitBreaker::new("bq-generate-text", config);
        breaker.force_open();
        tokio::time::advance(Duration::from_secs(1)).await;

        let trial = breaker.try_acquire().unwrap();
        drop(trial);

        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn test_stale_permit_outcome_ignored() {
        let config = CircuitBreakerConfig::default().with_failure_threshold(2);
        let breaker = CircuitBreaker::new("bq-generate-text", config);

        let stale = breaker.try_acquire().unwrap();
        breaker.force_open();
        breaker.reset();

        stale.fail();
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_reset_and_force_open() {
        let breaker = CircuitBreaker::with_defaults("bq-generate-text");

        breaker.force_open();
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.snapshot().trips, 0);
    }

    #[test]
    fn test_circuit_breaker_debug() {
        let breaker = CircuitBreaker::with_defaults("bq-generate-text");
        let debug_str = format!("{:?}", breaker);
        assert!(debug_str.contains("bq-generate-text"));
        assert!(debug_str.contains("Closed"));
    }
}
