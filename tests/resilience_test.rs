//! Resilience Pattern Integration Tests
//!
//! Retry, circuit breaker and the composed executor through the public API.
//! Timing-sensitive tests run on tokio's paused clock.

use futures::future::join_all;
use lexguard::{
    classify, execute_with_retry, guard, run, run_with_cancel, CancellationToken, CircuitBreaker,
    CircuitBreakerConfig, CircuitState, ErrorKind, ExecutionError, GuardError, RawFailure,
    RetryPolicy,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::default()
        .with_max_attempts(max_attempts)
        .with_base_delay(Duration::from_millis(1))
        .with_jitter(0.0)
}

// ============================================================================
// Retry Policy Edge Cases
// ============================================================================

#[tokio::test]
async fn test_retry_with_rate_limit_error_message() {
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_clone = attempts.clone();

    let result = execute_with_retry(
        || {
            let attempts = attempts_clone.clone();
            async move {
                let count = attempts.fetch_add(1, Ordering::SeqCst);
                if count < 2 {
                    Err(RawFailure::from_message("rate limit exceeded (429)"))
                } else {
                    Ok("success after rate limit")
                }
            }
        },
        &fast_policy(3),
    )
    .await;

    assert_eq!(result.unwrap(), "success after rate limit");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_with_connection_timeout_error() {
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_clone = attempts.clone();

    let result = execute_with_retry(
        || {
            let attempts = attempts_clone.clone();
            async move {
                let count = attempts.fetch_add(1, Ordering::SeqCst);
                if count < 1 {
                    Err(RawFailure::from_message("connection timed out"))
                } else {
                    Ok("recovered from timeout")
                }
            }
        },
        &fast_policy(2),
    )
    .await;

    assert_eq!(result.unwrap(), "recovered from timeout");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_retry_does_not_retry_401_unauthorized() {
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_clone = attempts.clone();

    let result = execute_with_retry(
        || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(RawFailure::from_message("401 Unauthorized"))
            }
        },
        &fast_policy(4),
    )
    .await;

    let err = result.unwrap_err();
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    match err {
        ExecutionError::NonRecoverable { record, earlier } => {
            assert_eq!(record.kind, ErrorKind::Authentication);
            assert_eq!(record.attempt_number, 1);
            assert!(earlier.is_empty());
        }
        other => panic!("expected NonRecoverable, got {:?}", other),
    }
}

#[tokio::test]
async fn test_non_recoverable_after_recoverable_keeps_history() {
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_clone = attempts.clone();

    let err = execute_with_retry(
        || {
            let attempts = attempts_clone.clone();
            async move {
                let count = attempts.fetch_add(1, Ordering::SeqCst);
                if count == 0 {
                    Err::<(), _>(RawFailure::status(503, "warming up"))
                } else {
                    Err(RawFailure::status(422, "bad citation format"))
                }
            }
        },
        &fast_policy(5),
    )
    .await
    .unwrap_err();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    let kinds: Vec<ErrorKind> = err.records().iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds,
        vec![ErrorKind::RemoteServiceUnavailable, ErrorKind::Validation]
    );
}

#[tokio::test]
async fn test_recoverable_exhausts_exactly_max_attempts() {
    for max_attempts in [1u32, 2, 5] {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let err = execute_with_retry(
            || {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(RawFailure::connection("connection reset by peer"))
                }
            },
            &fast_policy(max_attempts),
        )
        .await
        .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), max_attempts);
        match err {
            ExecutionError::Exhausted { records } => {
                assert_eq!(records.len() as u32, max_attempts);
                let numbers: Vec<u32> = records.iter().map(|r| r.attempt_number).collect();
                assert_eq!(numbers, (1..=max_attempts).collect::<Vec<_>>());
                assert!(records.iter().all(|r| r.kind == ErrorKind::Network));
            }
            other => panic!("expected Exhausted, got {:?}", other),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_twice_then_success_end_to_end() {
    let policy = RetryPolicy::default()
        .with_max_attempts(3)
        .with_base_delay(Duration::from_secs(1))
        .with_jitter(0.0);
    let breaker = CircuitBreaker::with_defaults("bq-generate-text");
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_clone = attempts.clone();

    let start = Instant::now();
    let result = run(
        || {
            let attempts = attempts_clone.clone();
            async move {
                let count = attempts.fetch_add(1, Ordering::SeqCst);
                if count < 2 {
                    Err(RawFailure::status(429, "Too Many Requests"))
                } else {
                    Ok("summary")
                }
            }
        },
        &policy,
        &breaker,
    )
    .await;
    let elapsed = start.elapsed();

    assert_eq!(result.unwrap(), "summary");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    // 1s after attempt 1, 2s after attempt 2
    assert!(elapsed >= Duration::from_secs(3), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(3010), "{:?}", elapsed);
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_delay_capped_at_max_delay() {
    let policy = RetryPolicy::default()
        .with_max_attempts(4)
        .with_base_delay(Duration::from_secs(10))
        .with_max_delay(Duration::from_secs(15))
        .with_jitter(0.0);

    let start = Instant::now();
    let _ = execute_with_retry(
        || async { Err::<(), _>(RawFailure::status(503, "")) },
        &policy,
    )
    .await;

    // 10s + 15s + 15s
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(40), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(40_010), "{:?}", elapsed);
}

// ============================================================================
// Circuit Breaker State Transitions
// ============================================================================

#[tokio::test]
async fn test_circuit_breaker_opens_after_threshold_and_fails_fast() {
    let breaker = CircuitBreaker::new(
        "bq-vector-search",
        CircuitBreakerConfig::default().with_failure_threshold(5),
    );
    let invocations = Arc::new(AtomicU32::new(0));

    for _ in 0..5 {
        let invocations = invocations.clone();
        let result = guard(&breaker, move || {
            invocations.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(RawFailure::status(500, "")) }
        })
        .await;
        assert!(matches!(result, Err(GuardError::Failed(_))));
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let invocations_clone = invocations.clone();
    let sixth = guard(&breaker, move || {
        invocations_clone.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, RawFailure>(()) }
    })
    .await;

    match sixth {
        Err(GuardError::Open(rejection)) => {
            assert_eq!(rejection.endpoint, "bq-vector-search");
            assert_eq!(rejection.state, CircuitState::Open);
        }
        other => panic!("expected rejection, got {:?}", other),
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_non_recoverable_failures_count_toward_threshold() {
    let breaker = CircuitBreaker::new(
        "bq-generate-text",
        CircuitBreakerConfig::default().with_failure_threshold(2),
    );

    for _ in 0..2 {
        let _ = guard(&breaker, || async {
            Err::<(), _>(RawFailure::status(401, "invalid key"))
        })
        .await;
    }

    assert_eq!(breaker.state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_admits_exactly_one_concurrent_caller() {
    let breaker = CircuitBreaker::new(
        "bq-vector-search",
        CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_recovery_timeout(Duration::from_millis(100)),
    );
    breaker.force_open();
    tokio::time::advance(Duration::from_millis(100)).await;

    let invocations = Arc::new(AtomicU32::new(0));
    let calls = (0..10).map(|_| {
        let invocations = invocations.clone();
        guard(&breaker, move || {
            let invocations = invocations.clone();
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, RawFailure>(())
            }
        })
    });
    let results = join_all(calls).await;

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);

    let rejected_half_open = results
        .iter()
        .filter(|r| matches!(r, Err(GuardError::Open(e)) if e.state == CircuitState::HalfOpen))
        .count();
    assert_eq!(rejected_half_open, 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_half_open_admits_one_trial_across_threads() {
    let breaker = Arc::new(CircuitBreaker::new(
        "bq-vector-search",
        CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_recovery_timeout(Duration::from_millis(20)),
    ));
    breaker.force_open();
    tokio::time::sleep(Duration::from_millis(40)).await;

    let callers = 16;
    let invocations = Arc::new(AtomicU32::new(0));
    let barrier = Arc::new(tokio::sync::Barrier::new(callers));
    let handles: Vec<_> = (0..callers)
        .map(|_| {
            let breaker = breaker.clone();
            let invocations = invocations.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                guard(&breaker, move || {
                    let invocations = invocations.clone();
                    async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok::<_, RawFailure>(())
                    }
                })
                .await
            })
        })
        .collect();

    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.expect("task panicked"))
        .collect();

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(GuardError::Open(e)) if e.state == CircuitState::HalfOpen))
        .count();
    assert_eq!(rejected, callers - 1);
}

#[tokio::test(start_paused = true)]
async fn test_successful_trials_close_and_reset_failures() {
    let breaker = CircuitBreaker::new(
        "bq-generate-text",
        CircuitBreakerConfig::default()
            .with_failure_threshold(3)
            .with_recovery_timeout(Duration::from_secs(30))
            .with_success_threshold(2),
    );
    for _ in 0..3 {
        let _ = guard(&breaker, || async { Err::<(), _>(RawFailure::status(503, "")) }).await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(30)).await;

    guard(&breaker, || async { Ok::<_, RawFailure>(()) })
        .await
        .unwrap();
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    guard(&breaker, || async { Ok::<_, RawFailure>(()) })
        .await
        .unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_trial_reopens_with_fresh_timer() {
    let recovery = Duration::from_secs(30);
    let breaker = CircuitBreaker::new(
        "bq-generate-text",
        CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_recovery_timeout(recovery),
    );
    breaker.force_open();
    tokio::time::advance(recovery).await;

    let trial = guard(&breaker, || async { Err::<(), _>(RawFailure::status(503, "")) }).await;
    assert!(matches!(trial, Err(GuardError::Failed(_))));
    assert_eq!(breaker.state(), CircuitState::Open);

    // the cooldown restarted at the failed trial
    tokio::time::advance(Duration::from_secs(10)).await;
    let acquired = breaker.try_acquire();
    match acquired {
        Err(rejection) => assert_eq!(rejection.retry_after, Duration::from_secs(20)),
        Ok(_) => panic!("breaker should still be open"),
    }
}

// ============================================================================
// Composed Executor
// ============================================================================

#[tokio::test]
async fn test_retry_stops_when_circuit_opens_mid_sequence() {
    let breaker = CircuitBreaker::new(
        "bq-vector-search",
        CircuitBreakerConfig::default().with_failure_threshold(2),
    );
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_clone = attempts.clone();

    let err = run(
        || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(RawFailure::status(502, "Bad Gateway"))
            }
        },
        &fast_policy(10),
        &breaker,
    )
    .await
    .unwrap_err();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    match err {
        ExecutionError::CircuitOpen { rejection, earlier } => {
            assert_eq!(rejection.state, CircuitState::Open);
            assert_eq!(earlier.len(), 2);
        }
        other => panic!("expected CircuitOpen, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff_returns_history() {
    let breaker = CircuitBreaker::with_defaults("bq-generate-text");
    let policy = RetryPolicy::default()
        .with_max_attempts(5)
        .with_base_delay(Duration::from_secs(60))
        .with_jitter(0.0);
    let cancel = CancellationToken::new();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        canceller.cancel();
    });

    let start = Instant::now();
    let err = run_with_cancel(
        || async { Err::<(), _>(RawFailure::status(503, "")) },
        &policy,
        &breaker,
        &cancel,
    )
    .await
    .unwrap_err();

    assert!(start.elapsed() < Duration::from_secs(60));
    match err {
        ExecutionError::Cancelled { records } => assert_eq!(records.len(), 1),
        other => panic!("expected Cancelled, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_attempt_timeout_is_recoverable() {
    let breaker = CircuitBreaker::with_defaults("bq-generate-text");
    let policy = fast_policy(2).with_attempt_timeout(Duration::from_millis(200));
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_clone = attempts.clone();

    let result = run(
        || {
            let attempts = attempts_clone.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                Ok::<_, RawFailure>("late but fine")
            }
        },
        &policy,
        &breaker,
    )
    .await;

    assert_eq!(result.unwrap(), "late but fine");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[test]
fn test_classify_is_idempotent() {
    let failure = RawFailure::from_message("HTTP 504 Gateway Timeout");
    assert_eq!(classify(&failure), classify(&failure));
    assert_eq!(classify(&failure), ErrorKind::RemoteTimeout);
}
