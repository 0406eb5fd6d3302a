//! Scheduler constants and state machine model.

use serde::{Deserialize, Serialize};

/// Allowed periodic sync intervals, in minutes.
pub const SYNC_INTERVALS_MINUTES: [u32; 5] = [15, 30, 60, 120, 240];

/// Default periodic interval.
pub const DEFAULT_SYNC_INTERVAL_MINUTES: u32 = 30;

/// Maximum jitter (seconds) added to periodic ticks.
pub const SYNC_INTERVAL_JITTER_SECS: u64 = 5;

/// Hard cap on one sync round's wall-clock time.
pub const SYNC_ROUND_TIMEOUT_SECS: u64 = 5 * 60;

/// Clamp an arbitrary interval to the nearest allowed value.
pub fn normalize_sync_interval(minutes: u32) -> u32 {
    SYNC_INTERVALS_MINUTES
        .iter()
        .copied()
        .min_by_key(|allowed| allowed.abs_diff(minutes))
        .unwrap_or(DEFAULT_SYNC_INTERVAL_MINUTES)
}

/// Background scheduler states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Stopped,
    Idle,
    Running,
    Paused,
}

impl SchedulerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerState::Stopped => "stopped",
            SchedulerState::Idle => "idle",
            SchedulerState::Running => "running",
            SchedulerState::Paused => "paused",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_normalization_snaps_to_allowed_values() {
        assert_eq!(normalize_sync_interval(15), 15);
        assert_eq!(normalize_sync_interval(30), 30);
        assert_eq!(normalize_sync_interval(1), 15);
        assert_eq!(normalize_sync_interval(100), 120);
        assert_eq!(normalize_sync_interval(10_000), 240);
    }
}
