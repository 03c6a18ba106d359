//! Failure classification
//!
//! Every failed attempt produces a [`RawFailure`] (what the operation saw) which
//! [`classify`] maps to an [`ErrorKind`]. The kind fixes the [`Severity`] and
//! whether the failure is worth retrying. [`ErrorRecord`] bundles all of it with
//! the diagnostic fields reported back to callers.
//!
//! # Mapping
//!
//! | Signal | Kind |
//! |--------|------|
//! | 400 / 404 / 409 / 413 / 422, schema failure | `Validation` |
//! | 401, unauthenticated | `Authentication` |
//! | 403, forbidden | `Authorization` |
//! | 408 / 504, attempt timeout | `RemoteTimeout` |
//! | 429 | `RateLimited` |
//! | 500 / 502 / 503 | `RemoteServiceUnavailable` |
//! | connection failure | `Network` |
//! | anything else | `Unknown` |

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Failure signal returned by an operation.
///
/// Closed set: operations that only have an error string can use
/// [`RawFailure::from_message`] to pick a variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFailure {
    /// HTTP-like status code from the remote
    Status { code: u16, message: String },
    /// The attempt did not complete before its deadline
    Timeout { elapsed: Duration },
    /// Connect, reset or DNS failure
    Connection { message: String },
    /// Payload failed schema or field validation
    Schema { message: String },
    /// Remote accepted the request but could not process it
    Processing { message: String },
    /// Persistence layer failure
    Storage { message: String },
    /// Missing or invalid credentials
    Unauthenticated { message: String },
    /// Credentials valid, access denied
    Forbidden { message: String },
    /// Unrecognized failure
    Other { message: String },
}

impl RawFailure {
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self::Status {
            code,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Infer a failure variant from free-form error text.
    ///
    /// Status codes win over keywords, so "503 connection pool exhausted" is a
    /// `Status`. Unmatched text becomes `Other`.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if let Some(code) = find_status_code(&lower) {
            return Self::Status { code, message };
        }

        if lower.contains("timed out") || lower.contains("timeout") || lower.contains("deadline")
        {
            Self::Timeout {
                elapsed: Duration::ZERO,
            }
        } else if lower.contains("rate limit") || lower.contains("too many requests") {
            Self::Status { code: 429, message }
        } else if lower.contains("unavailable") || lower.contains("temporar") {
            Self::Status { code: 503, message }
        } else if lower.contains("connection")
            || lower.contains("connect")
            || lower.contains("dns")
            || lower.contains("broken pipe")
        {
            Self::Connection { message }
        } else if lower.contains("unauthorized") || lower.contains("api key") {
            Self::Unauthenticated { message }
        } else if lower.contains("permission denied") || lower.contains("forbidden") {
            Self::Forbidden { message }
        } else if lower.contains("schema") || lower.contains("invalid field") {
            Self::Schema { message }
        } else {
            Self::Other { message }
        }
    }

    /// Human-readable description used for [`ErrorRecord::message`]
    pub fn describe(&self) -> String {
        match self {
            Self::Status { code, message } if message.is_empty() => format!("HTTP {}", code),
            Self::Status { code, message } => format!("HTTP {}: {}", code, message),
            Self::Timeout { elapsed } if elapsed.is_zero() => "operation timed out".to_string(),
            Self::Timeout { elapsed } => {
                format!("operation timed out after {}ms", elapsed.as_millis())
            }
            Self::Connection { message }
            | Self::Schema { message }
            | Self::Processing { message }
            | Self::Storage { message }
            | Self::Unauthenticated { message }
            | Self::Forbidden { message }
            | Self::Other { message } => message.clone(),
        }
    }
}

impl fmt::Display for RawFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Words that mark a following number as a status code.
const STATUS_CUES: [&str; 4] = ["http", "status", "code", "error"];

/// Units that mark a preceding number as a quantity, not a status code.
const QUANTITY_UNITS: [&str; 24] = [
    "ms", "s", "sec", "secs", "second", "seconds", "millis", "milliseconds", "us", "ns", "m",
    "min", "mins", "minute", "minutes", "h", "hours", "b", "bytes", "kb", "kib", "mb", "mib",
    "rows",
];

/// Find the first standalone 3-digit HTTP status (400..=599) in lowercase text.
///
/// A number right after a status cue ("http 503") always counts. Otherwise a
/// number followed by a unit ("450ms", "420 ms", "413 bytes") is skipped.
fn find_status_code(text: &str) -> Option<u16> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i - start != 3 {
            continue;
        }
        let Ok(code) = text[start..i].parse::<u16>() else {
            continue;
        };
        if !(400..=599).contains(&code) {
            continue;
        }
        if follows_status_cue(&text[..start]) || !precedes_unit(&text[i..]) {
            return Some(code);
        }
    }
    None
}

fn follows_status_cue(before: &str) -> bool {
    let word = before
        .trim_end_matches(|c: char| !c.is_ascii_alphanumeric())
        .rsplit(|c: char| !c.is_ascii_alphanumeric())
        .next()
        .unwrap_or("");
    STATUS_CUES.contains(&word)
}

fn precedes_unit(after: &str) -> bool {
    let after = after.trim_start();
    if after.starts_with('%') {
        return true;
    }
    let end = after
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(after.len());
    QUANTITY_UNITS.contains(&&after[..end])
}

/// Failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Authentication,
    Authorization,
    Processing,
    RemoteServiceUnavailable,
    RemoteTimeout,
    RateLimited,
    Network,
    Storage,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 10] = [
        ErrorKind::Validation,
        ErrorKind::Authentication,
        ErrorKind::Authorization,
        ErrorKind::Processing,
        ErrorKind::RemoteServiceUnavailable,
        ErrorKind::RemoteTimeout,
        ErrorKind::RateLimited,
        ErrorKind::Network,
        ErrorKind::Storage,
        ErrorKind::Unknown,
    ];

    pub fn severity(self) -> Severity {
        match self {
            Self::Authentication | Self::Authorization | Self::Storage => Severity::Critical,
            Self::RemoteServiceUnavailable | Self::Processing => Severity::High,
            Self::RemoteTimeout | Self::RateLimited | Self::Network | Self::Unknown => {
                Severity::Medium
            }
            Self::Validation => Severity::Low,
        }
    }

    /// Whether another attempt could plausibly succeed
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            Self::RemoteServiceUnavailable
                | Self::RemoteTimeout
                | Self::RateLimited
                | Self::Network
                | Self::Storage
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Authentication => "authentication",
            Self::Authorization => "authorization",
            Self::Processing => "processing",
            Self::RemoteServiceUnavailable => "remote_service_unavailable",
            Self::RemoteTimeout => "remote_timeout",
            Self::RateLimited => "rate_limited",
            Self::Network => "network",
            Self::Storage => "storage",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        };
        f.write_str(s)
    }
}

/// Map a raw failure signal to its kind. Pure and deterministic.
pub fn classify(failure: &RawFailure) -> ErrorKind {
    match failure {
        RawFailure::Status { code, .. } => match code {
            400 | 404 | 409 | 413 | 422 => ErrorKind::Validation,
            401 => ErrorKind::Authentication,
            403 => ErrorKind::Authorization,
            408 | 504 => ErrorKind::RemoteTimeout,
            429 => ErrorKind::RateLimited,
            500 | 502 | 503 => ErrorKind::RemoteServiceUnavailable,
            _ => ErrorKind::Unknown,
        },
        RawFailure::Timeout { .. } => ErrorKind::RemoteTimeout,
        RawFailure::Connection { .. } => ErrorKind::Network,
        RawFailure::Schema { .. } => ErrorKind::Validation,
        RawFailure::Processing { .. } => ErrorKind::Processing,
        RawFailure::Storage { .. } => ErrorKind::Storage,
        RawFailure::Unauthenticated { .. } => ErrorKind::Authentication,
        RawFailure::Forbidden { .. } => ErrorKind::Authorization,
        RawFailure::Other { .. } => ErrorKind::Unknown,
    }
}

/// One failed attempt, as reported to the caller. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub recoverable: bool,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// 1-based attempt that produced this failure
    pub attempt_number: u32,
}

impl ErrorRecord {
    /// Classify `failure` and stamp it with the current time
    pub fn from_failure(failure: &RawFailure, attempt_number: u32) -> Self {
        let kind = classify(failure);
        Self {
            kind,
            severity: kind.severity(),
            recoverable: kind.is_recoverable(),
            message: failure.describe(),
            timestamp: Utc::now(),
            attempt_number,
        }
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attempt {} [{}/{}] {}",
            self.attempt_number, self.kind, self.severity, self.message
        )
    }
}
