//! Admission statistics, for observability only

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Bucketed label for the current global load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadStatus {
    Low,
    Normal,
    Medium,
    High,
    Overload,
}

impl LoadStatus {
    pub fn from_load(load: f64) -> Self {
        if load < 0.3 {
            LoadStatus::Low
        } else if load < 0.6 {
            LoadStatus::Normal
        } else if load < 0.8 {
            LoadStatus::Medium
        } else if load < 0.95 {
            LoadStatus::High
        } else {
            LoadStatus::Overload
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStatus::Low => "Low",
            LoadStatus::Normal => "Normal",
            LoadStatus::Medium => "Medium",
            LoadStatus::High => "High",
            LoadStatus::Overload => "Overload",
        }
    }
}

impl std::fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleCounters {
    pub total: u64,
    pub allowed: u64,
    pub blocked: u64,
    pub delayed: u64,
    /// Blocked by the duplicate layer (also counted in `blocked`)
    pub duplicates: u64,
    /// Delayed requests admitted on release (`readmit_at`)
    pub released: u64,
    /// Delayed requests still over budget on release and delayed again
    pub requeued: u64,
    /// Delayed requests blocked on release
    pub dropped: u64,
    pub cleanup_runs: u64,
}

/// Point-in-time snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleStats {
    #[serde(flatten)]
    pub counters: ThrottleCounters,
    /// Decisions turned into ALLOW because of an internal fault
    pub fail_open: u64,
    pub current_load: f64,
    pub status: LoadStatus,
    pub global_last_minute: usize,
    pub global_last_hour: usize,
    pub duplicate_entries: usize,
    pub delayed_pending: usize,
    pub channel_last_minute: BTreeMap<String, usize>,
}
