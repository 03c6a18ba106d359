//! Lexguard - retry and circuit breaking for calls to remote services
//!
//! ## Module Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        FAILURE MODEL                         │
//! │  classify/   RawFailure → ErrorKind → Severity, recoverable  │
//! │  operation/  Operation capability (one remote call)          │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      RESILIENCE LAYER                        │
//! │  retry/            RetryPolicy, backoff + jitter             │
//! │  circuit_breaker/  CircuitBreaker, Permit, guard             │
//! │  executor/         run: retry loop, breaker per attempt      │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       ENDPOINT LAYER                         │
//! │  endpoint/  ResilientEndpoint (policy + breaker + stats)     │
//! │  registry/  EndpointRegistry (one endpoint per name)         │
//! │  stats/     EndpointStats, latency percentiles               │
//! │  http/      HttpOperation (reqwest)                          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`classify`] | Failure taxonomy and the pure classifier |
//! | [`operation`] | `Operation` trait, blanket impl for async closures |
//! | [`retry`] | `RetryPolicy`, delay schedule, `execute_with_retry` |
//! | [`circuit_breaker`] | Closed / Open / HalfOpen state machine, `guard` |
//! | [`executor`] | Composed `run` / `run_with_cancel` |
//! | [`endpoint`] | Named endpoint with stats |
//! | [`registry`] | Endpoint lookup with config overrides (DashMap) |
//! | [`stats`] | In-memory call statistics |
//! | [`http`] | HTTP operation mapping responses to failures |
//! | [`config`] | `~/.config/lexguard/config.toml` + `LEXGUARD_*` env |
//! | [`error`] | Error types with codes and fix suggestions |
//!
//! ## Example
//!
//! ```rust,ignore
//! use lexguard::{run, CircuitBreaker, RetryPolicy, RawFailure};
//!
//! let policy = RetryPolicy::default();
//! let breaker = CircuitBreaker::with_defaults("bq-generate-text");
//!
//! let text = run(|| async { generate(&prompt).await.map_err(RawFailure::from_message) }, &policy, &breaker).await?;
//! ```

// ═══════════════════════════════════════════════════════════════
// FAILURE MODEL
// ═══════════════════════════════════════════════════════════════
pub mod classify;
pub mod operation;

// ═══════════════════════════════════════════════════════════════
// RESILIENCE LAYER
// ═══════════════════════════════════════════════════════════════
pub mod circuit_breaker;
pub mod executor;
pub mod retry;

// ═══════════════════════════════════════════════════════════════
// ENDPOINT LAYER
// ═══════════════════════════════════════════════════════════════
pub mod endpoint;
pub mod http;
pub mod registry;
pub mod stats;

// ═══════════════════════════════════════════════════════════════
// CROSS-CUTTING - Error handling, configuration
// ═══════════════════════════════════════════════════════════════
pub mod config;
pub mod error;

// ═══════════════════════════════════════════════════════════════
// PUBLIC API RE-EXPORTS
// ═══════════════════════════════════════════════════════════════

// Failure model
pub use classify::{classify, ErrorKind, ErrorRecord, RawFailure, Severity};
pub use operation::Operation;

// Resilience
pub use circuit_breaker::{
    guard, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState, Permit,
};
pub use executor::{run, run_with_cancel};
pub use retry::{execute_with_retry, BackoffKind, RetryPolicy};

// Endpoints
pub use endpoint::{EndpointSnapshot, ResilientEndpoint};
pub use http::{HttpOperation, HttpResponse};
pub use registry::EndpointRegistry;
pub use stats::{EndpointStats, LatencyStats, StatsSnapshot};

// Config and errors
pub use config::LexguardConfig;
pub use error::{CircuitOpenError, ExecutionError, FixSuggestion, GuardError, LexguardError};

// Cancellation token accepted by run_with_cancel
pub use tokio_util::sync::CancellationToken;
