//! Composed executor: retry loop with a circuit breaker around each attempt
//!
//! ```text
//!   attempt 1 ──► breaker admits? ──no──► CircuitOpen (no more attempts)
//!                      │ yes
//!                      ▼
//!               operation.invoke()  (bounded by attempt_timeout)
//!                      │
//!        ok ◄──────────┼──────────► failure ─► classify
//!        │                                  │
//!     return                 non-recoverable ┤ recoverable
//!                                  │         │
//!                          NonRecoverable    ├─ attempts left? ─no─► Exhausted
//!                                            │ yes
//!                                            ▼
//!                                  sleep(delay) or cancelled ─► Cancelled
//!                                            │
//!                                        attempt n+1
//! ```
//!
//! Attempts of one call are strictly sequential. Cancellation is only observed
//! between attempts: before admission and while sleeping.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::classify::{ErrorKind, ErrorRecord, RawFailure};
use crate::error::ExecutionError;
use crate::operation::Operation;
use crate::retry::RetryPolicy;

/// Result of driving one call, with what happened on the way
pub(crate) struct Drive<T> {
    pub result: Result<T, ExecutionError>,
    /// Attempts that actually invoked the operation
    pub attempts: u32,
    /// Kind of every failed attempt, including ones later retried away
    pub failures: Vec<ErrorKind>,
}

/// Run `operation` under `policy`, guarding each attempt with `breaker`.
///
/// A circuit-open rejection ends the loop immediately without using up the
/// remaining attempts.
pub async fn run<O: Operation>(
    operation: O,
    policy: &RetryPolicy,
    breaker: &CircuitBreaker,
) -> Result<O::Output, ExecutionError> {
    drive(operation, policy, Some(breaker), None, breaker.name())
        .await
        .result
}

/// [`run`], abortable between attempts through `cancel`
pub async fn run_with_cancel<O: Operation>(
    operation: O,
    policy: &RetryPolicy,
    breaker: &CircuitBreaker,
    cancel: &CancellationToken,
) -> Result<O::Output, ExecutionError> {
    drive(operation, policy, Some(breaker), Some(cancel), breaker.name())
        .await
        .result
}

pub(crate) async fn drive<O: Operation>(
    mut operation: O,
    policy: &RetryPolicy,
    breaker: Option<&CircuitBreaker>,
    cancel: Option<&CancellationToken>,
    label: &str,
) -> Drive<O::Output> {
    let max_attempts = policy.max_attempts.max(1);
    let mut records: Vec<ErrorRecord> = Vec::new();
    let mut failures = Vec::new();
    let mut invoked = 0u32;

    for attempt in 1..=max_attempts {
        if cancel.is_some_and(|token| token.is_cancelled()) {
            debug!(endpoint = label, attempt, "Retry sequence cancelled");
            return finish(
                Err(ExecutionError::Cancelled { records }),
                invoked,
                failures,
            );
        }

        let permit = match breaker {
            Some(breaker) => match breaker.try_acquire() {
                Ok(permit) => Some(permit),
                Err(rejection) => {
                    return finish(
                        Err(ExecutionError::CircuitOpen {
                            rejection,
                            earlier: records,
                        }),
                        invoked,
                        failures,
                    );
                }
            },
            None => None,
        };

        invoked += 1;
        let outcome = attempt_once(&mut operation, policy.attempt_timeout).await;

        if let Some(permit) = permit {
            match &outcome {
                Ok(_) => permit.succeed(),
                Err(_) => permit.fail(),
            }
        }

        let failure = match outcome {
            Ok(value) => {
                if !records.is_empty() {
                    debug!(
                        endpoint = label,
                        attempt,
                        earlier_failures = records.len(),
                        "Succeeded after retries"
                    );
                }
                return finish(Ok(value), invoked, failures);
            }
            Err(failure) => failure,
        };

        let record = ErrorRecord::from_failure(&failure, attempt);
        failures.push(record.kind);

        if !record.recoverable {
            warn!(
                endpoint = label,
                attempt,
                kind = %record.kind,
                error = %record.message,
                "Non-recoverable failure, not retrying"
            );
            return finish(
                Err(ExecutionError::NonRecoverable {
                    record,
                    earlier: records,
                }),
                invoked,
                failures,
            );
        }

        let kind = record.kind;
        records.push(record);

        if attempt == max_attempts {
            break;
        }

        let delay = policy.delay_for(attempt);
        debug!(
            endpoint = label,
            attempt,
            kind = %kind,
            delay_ms = delay.as_millis() as u64,
            "Recoverable failure, retrying"
        );

        if !sleep_unless_cancelled(delay, cancel).await {
            debug!(endpoint = label, attempt, "Retry sequence cancelled during backoff");
            return finish(
                Err(ExecutionError::Cancelled { records }),
                invoked,
                failures,
            );
        }
    }

    warn!(
        endpoint = label,
        attempts = max_attempts,
        "Retries exhausted"
    );
    finish(Err(ExecutionError::Exhausted { records }), invoked, failures)
}

fn finish<T>(
    result: Result<T, ExecutionError>,
    attempts: u32,
    failures: Vec<ErrorKind>,
) -> Drive<T> {
    Drive {
        result,
        attempts,
        failures,
    }
}

/// One invocation, converting an expired deadline into a timeout failure
async fn attempt_once<O: Operation>(
    operation: &mut O,
    timeout: Option<Duration>,
) -> Result<O::Output, RawFailure> {
    match timeout {
        Some(limit) => {
            let started = Instant::now();
            match tokio::time::timeout(limit, operation.invoke()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(RawFailure::Timeout {
                    elapsed: started.elapsed(),
                }),
            }
        }
        None => operation.invoke().await,
    }
}

/// Returns false when `cancel` fired before the delay elapsed
async fn sleep_unless_cancelled(delay: Duration, cancel: Option<&CancellationToken>) -> bool {
    match cancel {
        Some(token) => tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        },
        None => {
            tokio::time::sleep(delay).await;
            true
        }
    }
}
