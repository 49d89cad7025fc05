//! Message groups and grouping decisions

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::notification::{NotificationRequest, Priority};

/// How a group decides whether a new event belongs to it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingStrategy {
    /// Same event type, channel and project
    #[default]
    Exact,
    /// Exact match plus token overlap with the most recent members
    Similarity,
}

impl GroupingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupingStrategy::Exact => "exact",
            GroupingStrategy::Similarity => "similarity",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupAction {
    /// No group could take the event; send it standalone
    Merge,
    /// The event joined (or started) a group
    Group,
    /// Batching is switched off for this event; send it standalone
    Suppress,
    /// The matching group is full or overdue and must be flushed; the event was not added
    Escalate,
}

impl std::fmt::Display for GroupAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            GroupAction::Merge => "MERGE",
            GroupAction::Group => "GROUP",
            GroupAction::Suppress => "SUPPRESS",
            GroupAction::Escalate => "ESCALATE",
        };
        write!(f, "{}", label)
    }
}

/// 分组结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupingDecision {
    pub should_group: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub action: GroupAction,
}

impl GroupingDecision {
    pub fn grouped(group_id: impl Into<String>) -> Self {
        Self {
            should_group: true,
            group_id: Some(group_id.into()),
            action: GroupAction::Group,
        }
    }

    pub fn escalate(group_id: impl Into<String>) -> Self {
        Self {
            should_group: false,
            group_id: Some(group_id.into()),
            action: GroupAction::Escalate,
        }
    }

    pub fn merge() -> Self {
        Self {
            should_group: false,
            group_id: None,
            action: GroupAction::Merge,
        }
    }

    pub fn suppress() -> Self {
        Self {
            should_group: false,
            group_id: None,
            action: GroupAction::Suppress,
        }
    }
}

/// Why a group was handed out for delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    SizeThreshold,
    Timeout,
    UrgentBurst,
    Escalated,
    Forced,
}

/// A batch of similar events waiting to be delivered as one message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageGroup {
    pub group_id: String,
    pub strategy: GroupingStrategy,
    pub channel: String,
    pub event_type: String,
    pub project: Option<String>,
    /// Highest priority among the members
    pub priority: Priority,
    /// Members in arrival order
    pub members: Vec<NotificationRequest>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    /// Set once a matching event found the group full or overdue
    #[serde(default)]
    pub escalated: bool,
}

impl MessageGroup {
    pub fn new(
        group_id: impl Into<String>,
        strategy: GroupingStrategy,
        first: NotificationRequest,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            strategy,
            channel: first.channel.clone(),
            event_type: first.event_type.clone(),
            project: first.project(),
            priority: first.priority,
            members: vec![first],
            created_at: now,
            last_updated_at: now,
            escalated: false,
        }
    }

    pub fn add(&mut self, member: NotificationRequest, now: DateTime<Utc>) {
        self.priority = self.priority.max(member.priority);
        self.members.push(member);
        if now > self.last_updated_at {
            self.last_updated_at = now;
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }

    pub fn first(&self) -> Option<&NotificationRequest> {
        self.members.first()
    }

    pub fn last(&self) -> Option<&NotificationRequest> {
        self.members.last()
    }

    /// Up to `n` most recent members, newest last
    pub fn recent_members(&self, n: usize) -> &[NotificationRequest] {
        let start = self.members.len().saturating_sub(n);
        &self.members[start..]
    }

    /// Whether an event may join this group, strategy aside
    pub fn matches(&self, request: &NotificationRequest) -> bool {
        if self.event_type != request.event_type || self.channel != request.channel {
            return false;
        }
        match (&self.project, request.project()) {
            (Some(ours), Some(theirs)) => *ours == theirs,
            _ => true,
        }
    }

    /// Why this group should be delivered now, if it should
    pub fn flush_reason(
        &self,
        send_threshold: usize,
        send_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Option<FlushReason> {
        if self.escalated {
            Some(FlushReason::Escalated)
        } else if self.len() >= send_threshold {
            Some(FlushReason::SizeThreshold)
        } else if self.age(now) >= send_timeout {
            Some(FlushReason::Timeout)
        } else if self.priority >= Priority::High && self.len() >= 2 {
            Some(FlushReason::UrgentBurst)
        } else {
            None
        }
    }
}
