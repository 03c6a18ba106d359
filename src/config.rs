//! Lexguard Configuration Module
//!
//! Retry and circuit breaker defaults, plus per-endpoint overrides.
//! Config is stored in `~/.config/lexguard/config.toml`.
//!
//! ## Priority Order (highest to lowest)
//!
//! 1. Environment variables (`LEXGUARD_MAX_ATTEMPTS`, `LEXGUARD_JITTER`, ...)
//! 2. `[endpoints.<name>]` overrides, for that endpoint only
//! 3. `[retry]` / `[circuit_breaker]` sections
//! 4. Defaults
//!
//! ```toml
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 1000
//! max_delay_ms = 60000
//! jitter = 0.1
//! backoff = "exponential"
//!
//! [circuit_breaker]
//! failure_threshold = 5
//! recovery_timeout_ms = 30000
//! success_threshold = 2
//!
//! [endpoints.bq-generate-text]
//! max_attempts = 5
//! attempt_timeout_ms = 20000
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{LexguardError, Result};
use crate::retry::{BackoffKind, RetryPolicy};

pub const ENV_MAX_ATTEMPTS: &str = "LEXGUARD_MAX_ATTEMPTS";
pub const ENV_BASE_DELAY_MS: &str = "LEXGUARD_BASE_DELAY_MS";
pub const ENV_MAX_DELAY_MS: &str = "LEXGUARD_MAX_DELAY_MS";
pub const ENV_JITTER: &str = "LEXGUARD_JITTER";
pub const ENV_FAILURE_THRESHOLD: &str = "LEXGUARD_FAILURE_THRESHOLD";
pub const ENV_RECOVERY_TIMEOUT_MS: &str = "LEXGUARD_RECOVERY_TIMEOUT_MS";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LexguardConfig {
    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub circuit_breaker: BreakerSettings,

    /// Per-endpoint overrides, keyed by endpoint name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub endpoints: BTreeMap<String, EndpointOverrides>,
}

/// `[retry]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
    pub backoff: BackoffKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_timeout_ms: Option<u64>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            jitter: policy.jitter_fraction,
            backoff: policy.backoff_kind,
            attempt_timeout_ms: None,
        }
    }
}

/// `[circuit_breaker]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub success_threshold: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        let config = CircuitBreakerConfig::default();
        Self {
            failure_threshold: config.failure_threshold,
            recovery_timeout_ms: config.recovery_timeout.as_millis() as u64,
            success_threshold: config.success_threshold_to_close,
        }
    }
}

/// `[endpoints.<name>]` section; unset fields fall back to the global sections
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EndpointOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<u32>,
}

impl EndpointOverrides {
    /// Let every field set in `top` win over this one
    fn layer(&mut self, top: &EndpointOverrides) {
        self.max_attempts = top.max_attempts.or(self.max_attempts);
        self.base_delay_ms = top.base_delay_ms.or(self.base_delay_ms);
        self.max_delay_ms = top.max_delay_ms.or(self.max_delay_ms);
        self.jitter = top.jitter.or(self.jitter);
        self.backoff = top.backoff.or(self.backoff);
        self.attempt_timeout_ms = top.attempt_timeout_ms.or(self.attempt_timeout_ms);
        self.failure_threshold = top.failure_threshold.or(self.failure_threshold);
        self.recovery_timeout_ms = top.recovery_timeout_ms.or(self.recovery_timeout_ms);
        self.success_threshold = top.success_threshold.or(self.success_threshold);
    }
}

impl LexguardConfig {
    /// Get the config directory path
    ///
    /// Returns `~/.config/lexguard/` on Unix, `%APPDATA%/lexguard/` on Windows
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lexguard")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load configuration from the default path
    ///
    /// Returns default config if file doesn't exist.
    /// Returns error if file exists but is malformed.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| LexguardError::ConfigError {
            reason: format!("Failed to read config file: {}", e),
        })?;

        toml::from_str(&content).map_err(|e| LexguardError::ConfigError {
            reason: format!("Failed to parse config file: {}", e),
        })
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration, creating parent directories if needed
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                fs::create_dir_all(dir).map_err(|e| LexguardError::ConfigError {
                    reason: format!("Failed to create config directory: {}", e),
                })?;
            }
        }

        let content = toml::to_string_pretty(self).map_err(|e| LexguardError::ConfigError {
            reason: format!("Failed to serialize config: {}", e),
        })?;

        fs::write(path, content).map_err(|e| LexguardError::ConfigError {
            reason: format!("Failed to write config file: {}", e),
        })?;

        Ok(())
    }

    /// Merge with environment variables
    ///
    /// Non-empty `LEXGUARD_*` values take precedence over the file and over
    /// endpoint overrides. Unparseable values are an error, not ignored.
    pub fn with_env(mut self) -> Result<Self> {
        let env = EndpointOverrides {
            max_attempts: env_override(ENV_MAX_ATTEMPTS)?,
            base_delay_ms: env_override(ENV_BASE_DELAY_MS)?,
            max_delay_ms: env_override(ENV_MAX_DELAY_MS)?,
            jitter: env_override(ENV_JITTER)?,
            failure_threshold: env_override(ENV_FAILURE_THRESHOLD)?,
            recovery_timeout_ms: env_override(ENV_RECOVERY_TIMEOUT_MS)?,
            ..Default::default()
        };

        self.retry.max_attempts = env.max_attempts.unwrap_or(self.retry.max_attempts);
        self.retry.base_delay_ms = env.base_delay_ms.unwrap_or(self.retry.base_delay_ms);
        self.retry.max_delay_ms = env.max_delay_ms.unwrap_or(self.retry.max_delay_ms);
        self.retry.jitter = env.jitter.unwrap_or(self.retry.jitter);
        self.circuit_breaker.failure_threshold = env
            .failure_threshold
            .unwrap_or(self.circuit_breaker.failure_threshold);
        self.circuit_breaker.recovery_timeout_ms = env
            .recovery_timeout_ms
            .unwrap_or(self.circuit_breaker.recovery_timeout_ms);

        for overrides in self.endpoints.values_mut() {
            overrides.layer(&env);
        }

        Ok(self)
    }

    /// Global retry policy, validated
    pub fn to_policy(&self) -> Result<RetryPolicy> {
        build_policy(&self.retry)
    }

    /// Global breaker configuration, validated
    pub fn to_breaker_config(&self) -> Result<CircuitBreakerConfig> {
        build_breaker_config(&self.circuit_breaker)
    }

    /// Retry policy for `endpoint`, with its overrides applied
    pub fn policy_for(&self, endpoint: &str) -> Result<RetryPolicy> {
        let mut settings = self.retry.clone();
        if let Some(o) = self.endpoints.get(endpoint) {
            settings.max_attempts = o.max_attempts.unwrap_or(settings.max_attempts);
            settings.base_delay_ms = o.base_delay_ms.unwrap_or(settings.base_delay_ms);
            settings.max_delay_ms = o.max_delay_ms.unwrap_or(settings.max_delay_ms);
            settings.jitter = o.jitter.unwrap_or(settings.jitter);
            settings.backoff = o.backoff.unwrap_or(settings.backoff);
            settings.attempt_timeout_ms = o.attempt_timeout_ms.or(settings.attempt_timeout_ms);
        }
        build_policy(&settings)
    }

    /// Breaker configuration for `endpoint`, with its overrides applied
    pub fn breaker_config_for(&self, endpoint: &str) -> Result<CircuitBreakerConfig> {
        let mut settings = self.circuit_breaker.clone();
        if let Some(o) = self.endpoints.get(endpoint) {
            settings.failure_threshold = o.failure_threshold.unwrap_or(settings.failure_threshold);
            settings.recovery_timeout_ms =
                o.recovery_timeout_ms.unwrap_or(settings.recovery_timeout_ms);
            settings.success_threshold = o.success_threshold.unwrap_or(settings.success_threshold);
        }
        build_breaker_config(&settings)
    }
}

fn env_override<T: FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| LexguardError::InvalidSetting {
                field: key.to_string(),
                reason: format!("'{}': {}", raw, e),
            }),
        _ => Ok(None),
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> LexguardError {
    LexguardError::InvalidSetting {
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn build_policy(settings: &RetrySettings) -> Result<RetryPolicy> {
    if settings.max_attempts == 0 {
        return Err(invalid("retry.max_attempts", "must be at least 1"));
    }
    if !settings.jitter.is_finite() || !(0.0..=1.0).contains(&settings.jitter) {
        return Err(invalid("retry.jitter", "must be between 0.0 and 1.0"));
    }
    if settings.base_delay_ms > settings.max_delay_ms {
        return Err(invalid(
            "retry.base_delay_ms",
            format!(
                "{}ms exceeds max_delay_ms ({}ms)",
                settings.base_delay_ms, settings.max_delay_ms
            ),
        ));
    }
    if settings.attempt_timeout_ms == Some(0) {
        return Err(invalid("retry.attempt_timeout_ms", "must be greater than 0"));
    }

    let mut policy = RetryPolicy::default()
        .with_max_attempts(settings.max_attempts)
        .with_base_delay(Duration::from_millis(settings.base_delay_ms))
        .with_max_delay(Duration::from_millis(settings.max_delay_ms))
        .with_jitter(settings.jitter)
        .with_backoff(settings.backoff);
    if let Some(ms) = settings.attempt_timeout_ms {
        policy = policy.with_attempt_timeout(Duration::from_millis(ms));
    }
    Ok(policy)
}

fn build_breaker_config(settings: &BreakerSettings) -> Result<CircuitBreakerConfig> {
    if settings.failure_threshold == 0 {
        return Err(invalid(
            "circuit_breaker.failure_threshold",
            "must be at least 1",
        ));
    }
    if settings.success_threshold == 0 {
        return Err(invalid(
            "circuit_breaker.success_threshold",
            "must be at least 1",
        ));
    }

    Ok(CircuitBreakerConfig::default()
        .with_failure_threshold(settings.failure_threshold)
        .with_recovery_timeout(Duration::from_millis(settings.recovery_timeout_ms))
        .with_success_threshold(settings.success_threshold))
}
