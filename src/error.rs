//! Lexguard Error Types with Error Codes
//!
//! Error code ranges:
//! - LEX-000-009: Configuration errors
//! - LEX-030-039: HTTP operation errors
//! - LEX-040-049: Registry errors
//! - LEX-090-099: IO/serialization errors
//! - LEX-110-119: Execution outcomes (non-recoverable, exhausted, cancelled)
//! - LEX-120-129: Circuit breaker rejections
//!
//! [`ExecutionError`] is the terminal outcome of a guarded call. It is a plain
//! value: the executor never logs-and-swallows, callers decide what to report.

use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

use crate::circuit_breaker::CircuitState;
use crate::classify::ErrorRecord;

pub type Result<T> = std::result::Result<T, LexguardError>;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

/// Fast-fail rejection: the breaker refused to invoke the operation.
#[derive(Error, Debug, Diagnostic, Clone, PartialEq, Eq)]
#[error(
    "[LEX-120] Circuit breaker open for '{endpoint}' ({state}, retry in {}ms)",
    .retry_after.as_millis()
)]
#[diagnostic(
    code(lexguard::circuit_open),
    help("The endpoint failed repeatedly; wait for the recovery timeout or reset the breaker")
)]
pub struct CircuitOpenError {
    pub endpoint: String,
    /// `Open` while cooling down, `HalfOpen` while another caller holds the trial
    pub state: CircuitState,
    /// Remaining cooldown; zero when rejected because a trial is in flight
    pub retry_after: Duration,
}

fn last_message(records: &[ErrorRecord]) -> String {
    records
        .last()
        .map(|r| r.to_string())
        .unwrap_or_else(|| "no attempts recorded".to_string())
}

/// Terminal outcome of a retried and/or guarded call
#[derive(Error, Debug, Diagnostic, Clone)]
pub enum ExecutionError {
    #[error("[LEX-110] Non-recoverable failure: {record}")]
    #[diagnostic(
        code(lexguard::non_recoverable),
        help("Fix the request or credentials; retrying will not help")
    )]
    NonRecoverable {
        record: ErrorRecord,
        /// Recoverable failures from earlier attempts, oldest first
        earlier: Vec<ErrorRecord>,
    },

    #[error("[LEX-111] Retries exhausted after {} attempts, last: {}", .records.len(), last_message(.records))]
    #[diagnostic(
        code(lexguard::retries_exhausted),
        help("The remote kept failing transiently; check its health or raise max_attempts")
    )]
    Exhausted { records: Vec<ErrorRecord> },

    #[error("{rejection}")]
    #[diagnostic(code(lexguard::circuit_open))]
    CircuitOpen {
        rejection: CircuitOpenError,
        earlier: Vec<ErrorRecord>,
    },

    #[error("[LEX-113] Cancelled after {} failed attempts", .records.len())]
    #[diagnostic(code(lexguard::cancelled))]
    Cancelled { records: Vec<ErrorRecord> },
}

impl ExecutionError {
    /// Stable error code (e.g., "LEX-111")
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NonRecoverable { .. } => "LEX-110",
            Self::Exhausted { .. } => "LEX-111",
            Self::CircuitOpen { .. } => "LEX-120",
            Self::Cancelled { .. } => "LEX-113",
        }
    }

    /// Every failure record, in attempt order
    pub fn records(&self) -> Vec<&ErrorRecord> {
        match self {
            Self::NonRecoverable { record, earlier } => {
                earlier.iter().chain(std::iter::once(record)).collect()
            }
            Self::Exhausted { records } | Self::Cancelled { records } => records.iter().collect(),
            Self::CircuitOpen { earlier, .. } => earlier.iter().collect(),
        }
    }

    /// Record of the failure that ended the call, if one did
    pub fn last_record(&self) -> Option<&ErrorRecord> {
        match self {
            Self::NonRecoverable { record, .. } => Some(record),
            Self::Exhausted { records } | Self::Cancelled { records } => records.last(),
            Self::CircuitOpen { .. } => None,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn circuit_rejection(&self) -> Option<&CircuitOpenError> {
        match self {
            Self::CircuitOpen { rejection, .. } => Some(rejection),
            _ => None,
        }
    }
}

impl FixSuggestion for ExecutionError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            ExecutionError::NonRecoverable { record, .. } => match record.kind {
                crate::ErrorKind::Authentication => Some("Check the API key or service account"),
                crate::ErrorKind::Authorization => Some("Grant the caller access to the resource"),
                crate::ErrorKind::Validation => Some("Check the request payload and schema"),
                _ => Some("Inspect the remote service logs for this request"),
            },
            ExecutionError::Exhausted { .. } => {
                Some("Check remote service health or increase max_attempts")
            }
            ExecutionError::CircuitOpen { .. } => {
                Some("Wait for recovery_timeout or run with a fresh breaker")
            }
            ExecutionError::Cancelled { .. } => None,
        }
    }
}

/// Outcome of [`crate::guard`]: either the breaker said no, or the single
/// guarded attempt failed.
#[derive(Error, Debug, Diagnostic, Clone)]
pub enum GuardError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Open(#[from] CircuitOpenError),

    #[error("[LEX-112] Guarded call failed: {0}")]
    #[diagnostic(code(lexguard::guarded_failure))]
    Failed(ErrorRecord),
}

/// Crate-level error: configuration, IO and wrapped execution outcomes.
#[derive(Error, Debug, Diagnostic)]
pub enum LexguardError {
    // ═══════════════════════════════════════════
    // CONFIGURATION ERRORS (000-009)
    // ═══════════════════════════════════════════
    #[error("[LEX-001] Configuration error: {reason}")]
    #[diagnostic(
        code(lexguard::config_error),
        help("Check ~/.config/lexguard/config.toml syntax")
    )]
    ConfigError { reason: String },

    #[error("[LEX-002] Invalid value for '{field}': {reason}")]
    #[diagnostic(code(lexguard::invalid_setting))]
    InvalidSetting { field: String, reason: String },

    // ═══════════════════════════════════════════
    // HTTP OPERATION ERRORS (030-039)
    // ═══════════════════════════════════════════
    #[error("[LEX-030] Invalid URL '{url}': {reason}")]
    #[diagnostic(code(lexguard::invalid_url))]
    InvalidUrl { url: String, reason: String },

    #[error("[LEX-031] Failed to build HTTP client: {reason}")]
    #[diagnostic(code(lexguard::http_client))]
    HttpClient { reason: String },

    // ═══════════════════════════════════════════
    // REGISTRY ERRORS (040-049)
    // ═══════════════════════════════════════════
    #[error("[LEX-040] Endpoint '{name}' is not registered")]
    #[diagnostic(code(lexguard::endpoint_not_found))]
    EndpointNotFound { name: String },

    // ═══════════════════════════════════════════
    // IO / SERIALIZATION (090-099)
    // ═══════════════════════════════════════════
    #[error("[LEX-090] IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[LEX-091] JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ═══════════════════════════════════════════
    // EXECUTION (110-129)
    // ═══════════════════════════════════════════
    #[error(transparent)]
    #[diagnostic(transparent)]
    Execution(#[from] ExecutionError),
}

impl LexguardError {
    /// Get the error code (e.g., "LEX-001")
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError { .. } => "LEX-001",
            Self::InvalidSetting { .. } => "LEX-002",
            Self::InvalidUrl { .. } => "LEX-030",
            Self::HttpClient { .. } => "LEX-031",
            Self::EndpointNotFound { .. } => "LEX-040",
            Self::Io(_) => "LEX-090",
            Self::Json(_) => "LEX-091",
            Self::Execution(e) => e.error_code(),
        }
    }
}

impl FixSuggestion for LexguardError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            LexguardError::ConfigError { .. } => {
                Some("Run `lexguard config init` to write a fresh config file")
            }
            LexguardError::InvalidSetting { .. } => {
                Some("Check LEXGUARD_* environment variables and config.toml values")
            }
            LexguardError::InvalidUrl { .. } => Some("Use an absolute http:// or https:// URL"),
            LexguardError::HttpClient { .. } => None,
            LexguardError::EndpointNotFound { .. } => {
                Some("Register the endpoint with EndpointRegistry::get_or_create first")
            }
            LexguardError::Io(_) => Some("Check file permissions and that the path exists"),
            LexguardError::Json(_) => None,
            LexguardError::Execution(e) => e.fix_suggestion(),
        }
    }
}
