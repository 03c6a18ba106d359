//! Resilient endpoint
//!
//! A named remote with its own retry policy, circuit breaker and call
//! statistics. Every call goes through the composed executor, so each retry
//! attempt is guarded by the breaker independently and an opening circuit
//! stops the remaining attempts.
//!
//! # Example
//!
//! ```rust,ignore
//! use lexguard::{ResilientEndpoint, RetryPolicy, CircuitBreakerConfig};
//!
//! let endpoint = ResilientEndpoint::new(
//!     "bq-generate-text",
//!     RetryPolicy::default(),
//!     CircuitBreakerConfig::default(),
//! );
//!
//! let summary = endpoint.call(|| async { llm.generate(&prompt).await }).await?;
//! ```

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::error::ExecutionError;
use crate::executor::{self, Drive};
use crate::operation::Operation;
use crate::retry::RetryPolicy;
use crate::stats::{EndpointStats, StatsSnapshot};

/// Named endpoint owning its policy, breaker and stats
pub struct ResilientEndpoint {
    name: String,
    policy: RetryPolicy,
    breaker: CircuitBreaker,
    stats: EndpointStats,
}

impl ResilientEndpoint {
    pub fn new(
        name: impl Into<String>,
        policy: RetryPolicy,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        let name = name.into();
        Self {
            breaker: CircuitBreaker::new(name.clone(), breaker_config),
            stats: EndpointStats::new(name.clone()),
            policy,
            name,
        }
    }

    /// Create with default policy and breaker configuration
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, RetryPolicy::default(), CircuitBreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run `operation` with retries, each attempt guarded by the breaker
    pub async fn call<O: Operation>(&self, operation: O) -> Result<O::Output, ExecutionError> {
        self.execute(operation, None).await
    }

    /// [`Self::call`], abortable between attempts
    pub async fn call_with_cancel<O: Operation>(
        &self,
        operation: O,
        cancel: &CancellationToken,
    ) -> Result<O::Output, ExecutionError> {
        self.execute(operation, Some(cancel)).await
    }

    async fn execute<O: Operation>(
        &self,
        operation: O,
        cancel: Option<&CancellationToken>,
    ) -> Result<O::Output, ExecutionError> {
        let start = Instant::now();
        let drive = executor::drive(operation, &self.policy, Some(&self.breaker), cancel, &self.name)
            .await;
        self.record(&drive, start);
        drive.result
    }

    fn record<T>(&self, drive: &Drive<T>, start: Instant) {
        let latency = start.elapsed();

        for kind in &drive.failures {
            self.stats.record_failure_kind(*kind);
        }

        match &drive.result {
            Ok(_) => self.stats.record_success(latency, drive.attempts),
            Err(ExecutionError::CircuitOpen { .. }) => {
                self.stats.record_circuit_rejection();
                // rejected mid-sequence: the earlier attempts still failed
                if drive.attempts > 0 {
                    self.stats.record_failure(latency, drive.attempts);
                }
            }
            Err(ExecutionError::Cancelled { .. }) => self.stats.record_cancellation(),
            Err(_) => self.stats.record_failure(latency, drive.attempts),
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Breaker and stats together, for reporting
    pub fn snapshot(&self) -> EndpointSnapshot {
        EndpointSnapshot {
            breaker: self.breaker.snapshot(),
            stats: self.stats.snapshot(),
        }
    }

    /// Reset circuit breaker (for admin/testing)
    pub fn reset_circuit_breaker(&self) {
        self.breaker.reset();
    }

    /// Reset stats (for admin/testing)
    pub fn reset_stats(&self) {
        self.stats.reset();
    }
}

impl std::fmt::Debug for ResilientEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientEndpoint")
            .field("name", &self.name)
            .field("circuit_state", &self.breaker.state())
            .field("max_attempts", &self.policy.max_attempts)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointSnapshot {
    pub breaker: BreakerSnapshot,
    pub stats: StatsSnapshot,
}
