//! Per-endpoint call statistics
//!
//! In-memory only; nothing is exported or persisted. An [`EndpointStats`] is
//! owned by its [`crate::ResilientEndpoint`] and updated after each call.
//!
//! # Example
//!
//! ```rust,ignore
//! let stats = EndpointStats::new("bq-vector-search");
//! stats.record_success(Duration::from_millis(80), 1);
//!
//! let snapshot = stats.snapshot();
//! println!("{} calls, {:.1}% ok", snapshot.total_calls, snapshot.success_rate());
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::classify::ErrorKind;

/// Call statistics collector for one endpoint
pub struct EndpointStats {
    name: String,
    successes: AtomicU64,
    failures: AtomicU64,
    /// Attempts beyond the first, across all calls
    retries: AtomicU64,
    /// Calls refused by the circuit breaker
    circuit_rejections: AtomicU64,
    cancellations: AtomicU64,
    /// Failed attempts per kind, including retried ones
    failure_kinds: Mutex<BTreeMap<ErrorKind, u64>>,
    /// Recent call latencies in microseconds, oldest first
    latencies: Mutex<VecDeque<u64>>,
    max_samples: usize,
    start_time: Instant,
}

impl EndpointStats {
    const DEFAULT_MAX_SAMPLES: usize = 1000;

    pub fn new(name: impl Into<String>) -> Self {
        Self::with_max_samples(name, Self::DEFAULT_MAX_SAMPLES)
    }

    /// Create stats with a custom latency window
    pub fn with_max_samples(name: impl Into<String>, max_samples: usize) -> Self {
        let max_samples = max_samples.max(1);
        Self {
            name: name.into(),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            circuit_rejections: AtomicU64::new(0),
            cancellations: AtomicU64::new(0),
            failure_kinds: Mutex::new(BTreeMap::new()),
            latencies: Mutex::new(VecDeque::with_capacity(max_samples)),
            max_samples,
            start_time: Instant::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record a call that ended in success after `attempts` invocations
    pub fn record_success(&self, latency: Duration, attempts: u32) {
        self.successes.fetch_add(1, Ordering::SeqCst);
        self.record_retries(attempts);
        self.record_latency(latency);
    }

    /// Record a call that ended in a terminal failure after `attempts` invocations
    pub fn record_failure(&self, latency: Duration, attempts: u32) {
        self.failures.fetch_add(1, Ordering::SeqCst);
        self.record_retries(attempts);
        self.record_latency(latency);
    }

    pub fn record_circuit_rejection(&self) {
        self.circuit_rejections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_cancellation(&self) {
        self.cancellations.fetch_add(1, Ordering::SeqCst);
    }

    /// Count one failed attempt of `kind`
    pub fn record_failure_kind(&self, kind: ErrorKind) {
        *self.failure_kinds.lock().entry(kind).or_insert(0) += 1;
    }

    fn record_retries(&self, attempts: u32) {
        let retries = u64::from(attempts.saturating_sub(1));
        if retries > 0 {
            self.retries.fetch_add(retries, Ordering::SeqCst);
        }
    }

    fn record_latency(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        let mut latencies = self.latencies.lock();

        if latencies.len() >= self.max_samples {
            latencies.pop_front();
        }
        latencies.push_back(micros);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let successes = self.successes.load(Ordering::SeqCst);
        let failures = self.failures.load(Ordering::SeqCst);

        let latency = {
            let latencies = self.latencies.lock();
            LatencyStats::from_samples(latencies.iter().copied())
        };

        StatsSnapshot {
            name: self.name.clone(),
            total_calls: successes + failures,
            successes,
            failures,
            retries: self.retries.load(Ordering::SeqCst),
            circuit_rejections: self.circuit_rejections.load(Ordering::SeqCst),
            cancellations: self.cancellations.load(Ordering::SeqCst),
            failures_by_kind: self.failure_kinds.lock().clone(),
            latency,
            uptime: self.start_time.elapsed(),
        }
    }

    pub fn reset(&self) {
        self.successes.store(0, Ordering::SeqCst);
        self.failures.store(0, Ordering::SeqCst);
        self.retries.store(0, Ordering::SeqCst);
        self.circuit_rejections.store(0, Ordering::SeqCst);
        self.cancellations.store(0, Ordering::SeqCst);
        self.failure_kinds.lock().clear();
        self.latencies.lock().clear();
    }
}

impl std::fmt::Debug for EndpointStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("EndpointStats")
            .field("name", &self.name)
            .field("total_calls", &snapshot.total_calls)
            .field("failures", &snapshot.failures)
            .field("success_rate", &format!("{:.1}%", snapshot.success_rate()))
            .finish()
    }
}

/// Snapshot of endpoint statistics at a point in time
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub name: String,
    /// Calls that ended in success or failure; rejections and cancellations are counted apart
    pub total_calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub circuit_rejections: u64,
    pub cancellations: u64,
    pub failures_by_kind: BTreeMap<ErrorKind, u64>,
    pub latency: LatencyStats,
    #[serde(skip)]
    pub uptime: Duration,
}

impl StatsSnapshot {
    /// Success rate as percentage (0.0 to 100.0); 100 when idle
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 100.0;
        }
        self.successes as f64 / self.total_calls as f64 * 100.0
    }

    pub fn error_rate_exceeds(&self, threshold: f64) -> bool {
        if self.total_calls == 0 {
            return false;
        }
        self.failures as f64 / self.total_calls as f64 > threshold
    }
}

/// Latency statistics over the recent window
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LatencyStats {
    pub min: Duration,
    pub max: Duration,
    pub avg: Duration,
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub sample_count: usize,
}

impl LatencyStats {
    fn from_samples(samples: impl Iterator<Item = u64>) -> Self {
        let mut sorted: Vec<u64> = samples.collect();
        if sorted.is_empty() {
            return Self::default();
        }
        sorted.sort_unstable();

        let count = sorted.len();
        let sum: u128 = sorted.iter().map(|&s| u128::from(s)).sum();
        let avg = (sum / count as u128) as u64;
        let percentile = |p: usize| sorted[(count * p / 100).min(count - 1)];

        Self {
            min: Duration::from_micros(sorted[0]),
            max: Duration::from_micros(sorted[count - 1]),
            avg: Duration::from_micros(avg),
            p50: Duration::from_micros(percentile(50)),
            p95: Duration::from_micros(percentile(95)),
            p99: Duration::from_micros(percentile(99)),
            sample_count: count,
        }
    }
}
