//! Error taxonomy for fetching, configuration and auditing.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single source while pulling data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Transport-level failure. Retryable; rendered as "source unavailable".
    #[error("network error: {0}")]
    Network(String),
    /// The payload could not be understood. Not retryable; stops this source only.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("http status {status}: {message}")]
    Http { status: u16, message: String },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network(_) => true,
            FetchError::Http { status, .. } => *status == 429 || (500..600).contains(status),
            FetchError::MalformedPayload(_) | FetchError::Timeout(_) | FetchError::Cancelled => {
                false
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled)
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        FetchError::MalformedPayload(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialReason {
    /// The safety cap was reached before the reported total.
    SafetyCap,
    /// The source returned an empty page before the reported total.
    SourceExhausted,
}

/// Accumulated records never reached the source's own reported total.
///
/// This is a warning carried on the snapshot, not a hard failure.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("partial data: {accumulated} of {reported_total} records ({reason:?})")]
pub struct PartialDataError {
    pub accumulated: u64,
    pub reported_total: u64,
    pub reason: PartialReason,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("invalid audit configuration: {0}")]
    InvalidConfig(String),
    /// The run was cancelled; no report is emitted.
    #[error("audit cancelled")]
    Cancelled,
}

impl From<ConfigError> for AuditError {
    fn from(err: ConfigError) -> Self {
        AuditError::InvalidConfig(err.to_string())
    }
}
