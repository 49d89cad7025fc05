//! Priority levels for notification requests
//!
//! The core works on one ordered enum. Producers that send priorities as free text
//! go through [`Priority::from_label`], the single mapping table at the ingestion
//! boundary:
//! - CRITICAL: outage-level alarms, never shed under load
//! - HIGH: errors and failures a human should see quickly
//! - NORMAL: regular progress and change events
//! - LOW: chatter that can be dropped first when the channel is busy

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Priority of a notification request, ordered `Low < Normal < High < Critical`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Text labels accepted from producers, mapped to a priority
const PRIORITY_LABELS: &[(&str, Priority)] = &[
    ("low", Priority::Low),
    ("debug", Priority::Low),
    ("normal", Priority::Normal),
    ("medium", Priority::Normal),
    ("info", Priority::Normal),
    ("high", Priority::High),
    ("warning", Priority::High),
    ("critical", Priority::Critical),
    ("urgent", Priority::Critical),
    ("error", Priority::Critical),
];

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
            Priority::Critical => "CRITICAL",
        }
    }

    /// Map an external priority label to a priority
    ///
    /// Matching is case-insensitive and ignores surrounding whitespace.
    /// Unknown labels map to `Normal`.
    pub fn from_label(label: &str) -> Priority {
        let normalized = normalize_label(label);
        PRIORITY_LABELS
            .iter()
            .find(|(name, _)| *name == normalized)
            .map(|(_, priority)| *priority)
            .unwrap_or(Priority::Normal)
    }
}

fn normalize_label(label: &str) -> String {
    label.trim().to_lowercase()
}

impl Serialize for Priority {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Ok(Priority::from_label(&label))
    }
}
