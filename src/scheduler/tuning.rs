//! Hot-swappable scheduling knobs.

use serde::{Deserialize, Serialize};

pub const MAX_JITTER_PERCENT: u32 = 50;
pub const MAX_JITTER_SECONDS: u64 = 3600;
pub const MIN_STATS_LOG_SECONDS: u64 = 5;
pub const MAX_STATS_LOG_SECONDS: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    pub jitter_percent: u32,
    pub jitter_max_seconds: u64,
    /// 0 disables the periodic stats log line.
    pub stats_log_interval_seconds: u64,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            jitter_percent: 10,
            jitter_max_seconds: 30,
            stats_log_interval_seconds: 60,
        }
    }
}

impl Tuning {
    /// Clamp every knob into its supported range.
    pub fn normalized(self) -> Self {
        let stats_log_interval_seconds = match self.stats_log_interval_seconds {
            0 => 0,
            s => s.clamp(MIN_STATS_LOG_SECONDS, MAX_STATS_LOG_SECONDS),
        };
        Self {
            jitter_percent: self.jitter_percent.min(MAX_JITTER_PERCENT),
            jitter_max_seconds: self.jitter_max_seconds.min(MAX_JITTER_SECONDS),
            stats_log_interval_seconds,
        }
    }
}
