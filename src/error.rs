//! Error types for deskbridge
//!
//! Defines a comprehensive error enum covering all failure modes across the engine.
//! Uses thiserror for ergonomic error handling.

use thiserror::Error;

/// Result type alias for deskbridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Comprehensive error type for deskbridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration errors (missing host, credentials, project id)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Remote tracker errors (non-2xx responses, malformed payloads)
    #[error("Tracker error: {0}")]
    Tracker(String),

    /// Ticket or issue not found in the local store
    #[error("Not found: {0}")]
    NotFound(String),

    /// Object store errors
    #[error("Object store error: {0}")]
    ObjectStore(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// SQLite database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Rate limited (with retry-after duration in seconds)
    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    /// Other errors
    #[error("{0}")]
    Other(String),

    /// Anyhow errors (for more context)
    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),
}

impl crate::backend::retry::RetryableError for BridgeError {
    fn retry_decision(&self) -> crate::backend::retry::RetryDecision {
        use crate::backend::retry::RetryDecision;
        use std::time::Duration;

        match self {
            BridgeError::Http(e) => {
                if e.is_connect() || e.is_timeout() {
                    RetryDecision::Retry
                } else if e.is_status() {
                    if let Some(status) = e.status() {
                        match status.as_u16() {
                            429 => RetryDecision::RetryAfter(Duration::from_secs(60)),
                            500..=599 => RetryDecision::Retry,
                            _ => RetryDecision::NoRetry,
                        }
                    } else {
                        RetryDecision::NoRetry
                    }
                } else {
                    RetryDecision::Retry
                }
            }
            BridgeError::RateLimited(secs) => {
                RetryDecision::RetryAfter(Duration::from_secs(*secs))
            }
            BridgeError::Tracker(msg) => {
                // Server-side failures are worth a retry on the pull path;
                // anything else (4xx, bad payload) is permanent.
                if msg.contains("HTTP 5") || msg.contains("timeout") || msg.contains("connection") {
                    RetryDecision::Retry
                } else {
                    RetryDecision::NoRetry
                }
            }
            BridgeError::Config(_)
            | BridgeError::NotFound(_)
            | BridgeError::ObjectStore(_)
            | BridgeError::Io(_)
            | BridgeError::Json(_)
            | BridgeError::Yaml(_)
            | BridgeError::Database(_)
            | BridgeError::Other(_)
            | BridgeError::Anyhow(_) => RetryDecision::NoRetry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::retry::{RetryDecision, RetryableError};

    #[test]
    fn test_rate_limited_decision() {
        let err = BridgeError::RateLimited(30);
        assert_eq!(
            err.retry_decision(),
            RetryDecision::RetryAfter(std::time::Duration::from_secs(30))
        );
    }

    #[test]
    fn test_tracker_error_decisions() {
        let transient = BridgeError::Tracker("Redmine list failed: HTTP 502: bad gateway".into());
        assert_eq!(transient.retry_decision(), RetryDecision::Retry);

        let permanent = BridgeError::Tracker("Redmine create failed: HTTP 422: invalid".into());
        assert_eq!(permanent.retry_decision(), RetryDecision::NoRetry);
    }

    #[test]
    fn test_config_error_is_permanent() {
        let err = BridgeError::Config("missing redmine.url".into());
        assert_eq!(err.retry_decision(), RetryDecision::NoRetry);
    }
}
