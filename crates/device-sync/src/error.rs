//! Error types for the device sync crate.

use mailhaven_core::sync::SyncRetryClass;
use thiserror::Error;

/// Result type alias for device sync operations.
pub type Result<T> = std::result::Result<T, DeviceSyncError>;

/// Errors that can occur during device sync operations.
#[derive(Debug, Error)]
pub enum DeviceSyncError {
    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// API error response from the sync service
    #[error("API error ({status}): {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
        /// Retry-After seconds from a 429, used as the backoff floor.
        retry_after: Option<u64>,
    },

    /// Invalid request (missing required data, etc.)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication error (missing or invalid token, re-login required)
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Key derivation, encryption or integrity failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Local store failure
    #[error("Storage error: {0}")]
    Storage(#[from] mailhaven_core::errors::Error),

    /// Keys were zeroized (logout) while an operation was in progress
    #[error("Sync keys are not available; sign in first")]
    KeysUnavailable,

    /// Round cancelled at a phase boundary
    #[error("Sync round cancelled")]
    Cancelled,
}

impl DeviceSyncError {
    pub fn api(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            code: code.into(),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto(message.into())
    }

    /// HTTP status if this is an API error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Retry-After floor carried by a 429 response.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> SyncRetryClass {
        match self {
            Self::Api { status, .. } => mailhaven_core::sync::classify_http_status(*status),
            Self::Http(_) => SyncRetryClass::Retryable,
            Self::Auth(_) => SyncRetryClass::ReauthRequired,
            Self::KeysUnavailable => SyncRetryClass::ReauthRequired,
            Self::Json(_) => SyncRetryClass::Permanent,
            Self::InvalidRequest(_) => SyncRetryClass::Permanent,
            Self::Crypto(_) => SyncRetryClass::Permanent,
            Self::Storage(_) => SyncRetryClass::Permanent,
            Self::Cancelled => SyncRetryClass::Permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_class_for_auth_error_is_reauth() {
        let err = DeviceSyncError::api(401, "UNAUTHORIZED", "token expired");
        assert_eq!(err.retry_class(), SyncRetryClass::ReauthRequired);
    }

    #[test]
    fn retry_class_for_validation_is_fatal() {
        let err = DeviceSyncError::api(400, "BATCH_TOO_LARGE", "limit is 1000");
        assert_eq!(err.retry_class(), SyncRetryClass::Fatal);
    }

    #[test]
    fn rate_limit_carries_retry_after() {
        let err = DeviceSyncError::Api {
            status: 429,
            code: "RATE_LIMITED".to_string(),
            message: "slow down".to_string(),
            retry_after: Some(42),
        };
        assert_eq!(err.retry_after(), Some(42));
        assert_eq!(err.retry_class(), SyncRetryClass::Retryable);
    }
}
