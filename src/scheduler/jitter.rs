//! Deterministic per-monitor jitter.
//!
//! All offsets derive from SplitMix64 over the monitor id, so a monitor keeps
//! the same phase across restarts and never resynchronizes with its peers.

use chrono::{DateTime, Utc};

use super::tuning::Tuning;
use crate::db::{add_seconds, Monitor, MonitorState};

/// One SplitMix64 output step for `seed`.
pub fn splitmix64(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// `min(interval * percent / 100, max_seconds)`.
pub fn jitter_window_seconds(interval_seconds: u64, jitter_percent: u32, jitter_max_seconds: u64) -> u64 {
    let scaled = interval_seconds.saturating_mul(jitter_percent as u64) / 100;
    scaled.min(jitter_max_seconds)
}

/// Stable delay in `[0, window]` for a monitor.
pub fn jitter_delay_seconds(monitor_id: i64, window_seconds: u64) -> u64 {
    if window_seconds == 0 {
        return 0;
    }
    splitmix64(monitor_id as u64) % (window_seconds + 1)
}

/// When `monitor` next becomes eligible for a fresh (non-retry) attempt.
///
/// `None` when the interval or jitter pushes the time out of range.
pub fn eligible_at(
    monitor: &Monitor,
    state: Option<&MonitorState>,
    tuning: &Tuning,
) -> Option<DateTime<Utc>> {
    let interval = monitor.interval_seconds.max(1);
    let window = jitter_window_seconds(interval, tuning.jitter_percent, tuning.jitter_max_seconds);
    let jitter = jitter_delay_seconds(monitor.id, window);

    let base = match state.and_then(|s| s.last_checked_at) {
        Some(last) => monitor.next_check_after(last)?,
        None => monitor.created_at,
    };
    add_seconds(base, jitter)
}
