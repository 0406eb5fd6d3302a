//! Fixed-window rate limiting, keyed per user or per IP.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Outcome of a limiter check, carried into the response headers.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Unix seconds when the current window resets.
    pub reset: u64,
    /// Seconds until reset; the Retry-After value on a 429.
    pub retry_after: u64,
}

#[derive(Debug)]
struct Window {
    started_at: u64,
    count: u32,
}

/// In-memory fixed-window counters. Windows are keyed by
/// `"<class>:<principal>"` so upload/download/register/login stay independent.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, Window>>,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, key: &str, limit: u32, window_secs: u64) -> RateDecision {
        let now = now_unix();
        let mut windows = self.windows.lock().expect("limiter lock");

        let window = windows.entry(key.to_string()).or_insert(Window {
            started_at: now,
            count: 0,
        });
        if now.saturating_sub(window.started_at) >= window_secs {
            window.started_at = now;
            window.count = 0;
        }

        let reset = window.started_at + window_secs;
        if window.count >= limit {
            return RateDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset,
                retry_after: reset.saturating_sub(now).max(1),
            };
        }

        window.count += 1;
        RateDecision {
            allowed: true,
            limit,
            remaining: limit - window.count,
            reset,
            retry_after: 0,
        }
    }
}
