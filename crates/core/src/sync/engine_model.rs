//! Retry classification and backoff policy for the sync engine and queue.

use serde::{Deserialize, Serialize};

/// Retry policy classification for API failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRetryClass {
    /// Transient: 408/429/5xx and transport failures. Retried indefinitely.
    Retryable,
    /// Client-side defect (4xx other than auth/backpressure). Bounded retries.
    Permanent,
    /// 400 validation failure. One attempt, then the item is failed.
    Fatal,
    /// 401/403. The API client refreshes once; if that fails the engine pauses.
    ReauthRequired,
}

/// Permanent failures move a queue item to `Failed` after this many attempts.
pub const QUEUE_PERMANENT_FAILURE_LIMIT: i32 = 10;

/// Backoff cap for the offline queue.
pub const QUEUE_BACKOFF_CAP_SECONDS: i64 = 300;

/// Classify an HTTP status into retry behavior.
pub fn classify_http_status(status: u16) -> SyncRetryClass {
    match status {
        400 => SyncRetryClass::Fatal,
        401 | 403 => SyncRetryClass::ReauthRequired,
        408 | 429 => SyncRetryClass::Retryable,
        500..=599 => SyncRetryClass::Retryable,
        _ => SyncRetryClass::Permanent,
    }
}

/// Un-jittered queue backoff: `min(2^(attempts-1) * 1s, 5min)`.
///
/// The caller applies ±20% jitter (the engine crate owns the RNG).
pub fn queue_backoff_seconds(attempts: i32) -> i64 {
    let exponent = attempts.saturating_sub(1).clamp(0, 16) as u32;
    (1_i64 << exponent).min(QUEUE_BACKOFF_CAP_SECONDS)
}

/// Lightweight metrics for one completed sync round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRoundMetrics {
    pub pushed_count: usize,
    pub pulled_count: usize,
    pub conflict_count: usize,
    pub duration_ms: i64,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_http_status_for_retry_policy() {
        assert_eq!(classify_http_status(500), SyncRetryClass::Retryable);
        assert_eq!(classify_http_status(429), SyncRetryClass::Retryable);
        assert_eq!(classify_http_status(408), SyncRetryClass::Retryable);
        assert_eq!(classify_http_status(401), SyncRetryClass::ReauthRequired);
        assert_eq!(classify_http_status(400), SyncRetryClass::Fatal);
        assert_eq!(classify_http_status(404), SyncRetryClass::Permanent);
        assert_eq!(classify_http_status(409), SyncRetryClass::Permanent);
    }

    #[test]
    fn backoff_doubles_from_one_second_and_caps_at_five_minutes() {
        assert_eq!(queue_backoff_seconds(1), 1);
        assert_eq!(queue_backoff_seconds(2), 2);
        assert_eq!(queue_backoff_seconds(3), 4);
        assert_eq!(queue_backoff_seconds(9), 256);
        assert_eq!(queue_backoff_seconds(10), 300);
        assert_eq!(queue_backoff_seconds(40), 300);
    }

    #[test]
    fn backoff_tolerates_zero_attempts() {
        assert_eq!(queue_backoff_seconds(0), 1);
    }
}
