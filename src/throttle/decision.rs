//! Admission decision returned to producers

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThrottleAction {
    Allow,
    Block,
    Delay,
}

impl std::fmt::Display for ThrottleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ThrottleAction::Allow => "ALLOW",
            ThrottleAction::Block => "BLOCK",
            ThrottleAction::Delay => "DELAY",
        };
        write!(f, "{}", label)
    }
}

/// 准入结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleDecision {
    pub action: ThrottleAction,
    pub reason: String,
    /// For DELAY: how long the caller should hold the request.
    /// For a cooldown BLOCK: the remaining cooldown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<Duration>,
}

impl ThrottleDecision {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            action: ThrottleAction::Allow,
            reason: reason.into(),
            delay: None,
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            action: ThrottleAction::Block,
            reason: reason.into(),
            delay: None,
        }
    }

    pub fn delay(reason: impl Into<String>, delay: Duration) -> Self {
        Self {
            action: ThrottleAction::Delay,
            reason: reason.into(),
            delay: Some(delay),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn is_allowed(&self) -> bool {
        self.action == ThrottleAction::Allow
    }

    pub fn is_blocked(&self) -> bool {
        self.action == ThrottleAction::Block
    }

    pub fn is_delayed(&self) -> bool {
        self.action == ThrottleAction::Delay
    }
}
