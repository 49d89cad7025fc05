//! Grouping engine - time-windowed batching with optional similarity matching
//!
//! ## Decision flow
//! 1. Event types that bypass batching → SUPPRESS
//! 2. Matching group with room → GROUP (event added)
//! 3. Matching group that is full or past its send timeout → ESCALATE (event not added,
//!    group marked for immediate flush)
//! 4. No match and room for another group → GROUP (new group)
//! 5. No match and no room, even after expiry → MERGE (send standalone)

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use super::group::{FlushReason, GroupingDecision, GroupingStrategy, MessageGroup};
use super::similarity::{best_similarity, event_tokens};
use crate::config::GroupingConfig;
use crate::error::Result;
use crate::notification::NotificationRequest;

/// Members compared against under the similarity strategy
const SIMILARITY_SAMPLE: usize = 3;
/// Minimum spacing between two lazy expiry passes
const CLEANUP_INTERVAL_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupingCounters {
    pub evaluated: u64,
    pub groups_created: u64,
    /// Events added to an existing group
    pub members_added: u64,
    pub groups_flushed: u64,
    pub groups_expired: u64,
    pub escalations: u64,
    /// Events sent standalone because no group could take them
    pub merged: u64,
    pub suppressed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupingStats {
    #[serde(flatten)]
    pub counters: GroupingCounters,
    pub active_groups: usize,
    pub pending_members: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest_group_age_secs: Option<i64>,
}

struct GroupingState {
    groups: HashMap<String, MessageGroup>,
    next_id: u64,
    counters: GroupingCounters,
    last_cleanup: Option<DateTime<Utc>>,
}

/// 分组引擎
///
/// Owns its own lock, separate from the admission controller's.
pub struct GroupingEngine {
    config: GroupingConfig,
    state: Mutex<GroupingState>,
}

impl GroupingEngine {
    pub fn new(config: GroupingConfig) -> Result<Self> {
        config.validate()?;
        if config.send_threshold > config.max_group_size {
            warn!(
                send_threshold = config.send_threshold,
                max_group_size = config.max_group_size,
                "send_threshold exceeds max_group_size, groups flush by escalation or timeout"
            );
        }
        info!(
            enabled = config.enabled,
            strategy = config.default_strategy.as_str(),
            send_threshold = config.send_threshold,
            send_timeout_secs = config.send_timeout_secs,
            max_active_groups = config.max_active_groups,
            "Grouping engine ready"
        );

        Ok(Self {
            config,
            state: Mutex::new(GroupingState {
                groups: HashMap::new(),
                next_id: 0,
                counters: GroupingCounters::default(),
                last_cleanup: None,
            }),
        })
    }

    pub fn config(&self) -> &GroupingConfig {
        &self.config
    }

    pub fn evaluate(&self, request: &NotificationRequest) -> GroupingDecision {
        self.evaluate_at(request, Utc::now())
    }

    /// Route an admitted event at an explicit time
    ///
    /// Never fails: an internal fault yields MERGE so the event is sent standalone.
    pub fn evaluate_at(&self, request: &NotificationRequest, now: DateTime<Utc>) -> GroupingDecision {
        match self.try_evaluate(request, now) {
            Ok(decision) => {
                debug!(
                    request_id = %request.id,
                    event_type = %request.event_type,
                    action = %decision.action,
                    group_id = ?decision.group_id,
                    "Grouping decision"
                );
                decision
            }
            Err(e) => {
                warn!(request_id = %request.id, error = %e, "Grouping failed, sending standalone");
                GroupingDecision::merge()
            }
        }
    }

    fn try_evaluate(&self, request: &NotificationRequest, now: DateTime<Utc>) -> Result<GroupingDecision> {
        let mut state = self.state.lock()?;
        state.counters.evaluated += 1;

        if !self.config.enabled || self.config.bypass_event_types.contains(&request.event_type) {
            state.counters.suppressed += 1;
            return Ok(GroupingDecision::suppress());
        }

        self.maybe_expire(&mut state, now);

        if let Some(group_id) = self.find_candidate(&state, request, now) {
            return Ok(self.join_or_escalate(&mut state, group_id, request, now));
        }

        if state.groups.len() >= self.config.max_active_groups {
            self.expire_groups(&mut state, now);
        }
        if state.groups.len() >= self.config.max_active_groups {
            state.counters.merged += 1;
            warn!(
                active_groups = state.groups.len(),
                event_type = %request.event_type,
                "Group capacity reached, sending standalone"
            );
            return Ok(GroupingDecision::merge());
        }

        state.next_id += 1;
        let group_id = format!("grp-{}-{}", now.timestamp_millis(), state.next_id);
        let strategy = self.config.strategy_for(&request.event_type);
        let group = MessageGroup::new(group_id.clone(), strategy, request.clone(), now);
        state.groups.insert(group_id.clone(), group);
        state.counters.groups_created += 1;
        debug!(group_id = %group_id, strategy = strategy.as_str(), "Group created");

        Ok(GroupingDecision::grouped(group_id))
    }

    /// Most recently updated group the event may join
    fn find_candidate(
        &self,
        state: &GroupingState,
        request: &NotificationRequest,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let window = self.config.group_window();
        let mut tokens = None;

        state
            .groups
            .values()
            .filter(|group| group.matches(request) && group.age(now) < window)
            .filter(|group| match group.strategy {
                GroupingStrategy::Exact => true,
                GroupingStrategy::Similarity => {
                    let tokens = tokens.get_or_insert_with(|| event_tokens(request));
                    best_similarity(tokens, group.recent_members(SIMILARITY_SAMPLE))
                        >= self.config.similarity_threshold
                }
            })
            .max_by(|a, b| {
                a.last_updated_at
                    .cmp(&b.last_updated_at)
                    .then_with(|| a.created_at.cmp(&b.created_at))
                    .then_with(|| b.group_id.cmp(&a.group_id))
            })
            .map(|group| group.group_id.clone())
    }

    fn join_or_escalate(
        &self,
        state: &mut GroupingState,
        group_id: String,
        request: &NotificationRequest,
        now: DateTime<Utc>,
    ) -> GroupingDecision {
        let Some(group) = state.groups.get_mut(&group_id) else {
            return GroupingDecision::merge();
        };

        let full = group.len() >= self.config.max_group_size;
        let overdue = group.age(now) >= self.config.send_timeout();
        if full || overdue {
            group.escalated = true;
            state.counters.escalations += 1;
            info!(
                group_id = %group_id,
                members = group.len(),
                full,
                overdue,
                "Group escalated for immediate flush"
            );
            return GroupingDecision::escalate(group_id);
        }

        group.add(request.clone(), now);
        state.counters.members_added += 1;
        GroupingDecision::grouped(group_id)
    }

    pub fn take_ready_groups(&self) -> Vec<MessageGroup> {
        self.take_ready_groups_at(Utc::now())
    }

    /// Remove and return every group that should be delivered now, oldest first
    pub fn take_ready_groups_at(&self, now: DateTime<Utc>) -> Vec<MessageGroup> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Failed to collect ready groups");
                return Vec::new();
            }
        };

        let threshold = self.config.send_threshold;
        let timeout = self.config.send_timeout();
        let ready: Vec<(String, FlushReason)> = state
            .groups
            .values()
            .filter_map(|group| {
                group
                    .flush_reason(threshold, timeout, now)
                    .map(|reason| (group.group_id.clone(), reason))
            })
            .collect();

        let mut groups = Vec::with_capacity(ready.len());
        for (group_id, reason) in ready {
            if let Some(group) = state.groups.remove(&group_id) {
                debug!(group_id = %group_id, members = group.len(), reason = ?reason, "Group ready");
                groups.push(group);
            }
        }
        state.counters.groups_flushed += groups.len() as u64;
        groups.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.group_id.cmp(&b.group_id)));
        groups
    }

    /// Remove one group regardless of its readiness
    pub fn take_group(&self, group_id: &str) -> Option<MessageGroup> {
        let mut state = self.state.lock().ok()?;
        let group = state.groups.remove(group_id)?;
        state.counters.groups_flushed += 1;
        debug!(group_id = %group_id, members = group.len(), reason = ?FlushReason::Forced, "Group taken");
        Some(group)
    }

    /// Remove every group, e.g. on shutdown
    pub fn take_all(&self) -> Vec<MessageGroup> {
        let Ok(mut state) = self.state.lock() else {
            return Vec::new();
        };
        let mut groups: Vec<MessageGroup> = state.groups.drain().map(|(_, group)| group).collect();
        state.counters.groups_flushed += groups.len() as u64;
        groups.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.group_id.cmp(&b.group_id)));
        groups
    }

    pub fn active_groups(&self) -> usize {
        self.state.lock().map(|state| state.groups.len()).unwrap_or(0)
    }

    /// Copy of one group's current state
    pub fn group(&self, group_id: &str) -> Option<MessageGroup> {
        self.state.lock().ok()?.groups.get(group_id).cloned()
    }

    /// Drop groups past the expiry age now, returns how many were dropped
    pub fn cleanup_at(&self, now: DateTime<Utc>) -> usize {
        match self.state.lock() {
            Ok(mut state) => self.expire_groups(&mut state, now),
            Err(e) => {
                warn!(error = %e, "Group cleanup skipped");
                0
            }
        }
    }

    pub fn stats(&self) -> GroupingStats {
        self.stats_at(Utc::now())
    }

    pub fn stats_at(&self, now: DateTime<Utc>) -> GroupingStats {
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        GroupingStats {
            counters: state.counters,
            active_groups: state.groups.len(),
            pending_members: state.groups.values().map(MessageGroup::len).sum(),
            oldest_group_age_secs: state
                .groups
                .values()
                .map(|group| group.age(now).num_seconds())
                .max(),
        }
    }

    fn maybe_expire(&self, state: &mut GroupingState, now: DateTime<Utc>) {
        let due = match state.last_cleanup {
            Some(last) => now - last >= Duration::seconds(CLEANUP_INTERVAL_SECS),
            None => true,
        };
        if due {
            self.expire_groups(state, now);
        }
    }

    fn expire_groups(&self, state: &mut GroupingState, now: DateTime<Utc>) -> usize {
        let max_age = self.config.expiry_age();
        let before = state.groups.len();
        state.groups.retain(|group_id, group| {
            let keep = group.age(now) <= max_age;
            if !keep {
                warn!(
                    group_id = %group_id,
                    members = group.len(),
                    age_secs = group.age(now).num_seconds(),
                    "Expired group dropped undelivered"
                );
            }
            keep
        });
        let expired = before - state.groups.len();
        state.counters.groups_expired += expired as u64;
        state.last_cleanup = Some(now);
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouping::GroupAction;
    use crate::notification::Priority;
    use chrono::TimeZone;
    use serde_json::json;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn change(doc: &str) -> NotificationRequest {
        NotificationRequest::new(
            "document_change",
            "ops",
            Priority::Normal,
            json!({"doc_name": doc, "project": "wiki"}),
        )
    }

    fn engine(config: GroupingConfig) -> GroupingEngine {
        GroupingEngine::new(config).unwrap()
    }

    #[test]
    fn test_first_event_creates_group() {
        let engine = engine(GroupingConfig::default());
        let decision = engine.evaluate_at(&change("a.md"), t(0));

        assert_eq!(decision.action, GroupAction::Group);
        assert!(decision.should_group);
        assert_eq!(engine.active_groups(), 1);
    }

    #[test]
    fn test_matching_event_joins_group() {
        let engine = engine(GroupingConfig::default());
        let first = engine.evaluate_at(&change("a.md"), t(0));
        let second = engine.evaluate_at(&change("b.md"), t(1));

        assert_eq!(first.group_id, second.group_id);
        let group = engine.group(first.group_id.as_deref().unwrap()).unwrap();
        assert_eq!(group.len(), 2);
    }

    #[test]
    fn test_different_project_starts_new_group() {
        let engine = engine(GroupingConfig::default());
        let a = engine.evaluate_at(&change("a.md"), t(0));
        let other = NotificationRequest::new(
            "document_change",
            "ops",
            Priority::Normal,
            json!({"doc_name": "b.md", "project": "blog"}),
        );
        let b = engine.evaluate_at(&other, t(1));

        assert_ne!(a.group_id, b.group_id);
        assert_eq!(engine.active_groups(), 2);
    }

    #[test]
    fn test_overdue_group_escalates() {
        let engine = engine(GroupingConfig {
            send_timeout_secs: 30,
            ..Default::default()
        });
        let first = engine.evaluate_at(&change("a.md"), t(0));
        let late = engine.evaluate_at(&change("b.md"), t(40));

        assert_eq!(late.action, GroupAction::Escalate);
        assert_eq!(late.group_id, first.group_id);
        assert_eq!(engine.group(first.group_id.as_deref().unwrap()).unwrap().len(), 1);
    }

    #[test]
    fn test_group_outside_window_is_not_candidate() {
        let engine = engine(GroupingConfig {
            group_window_secs: 10,
            send_timeout_secs: 60,
            ..Default::default()
        });
        let first = engine.evaluate_at(&change("a.md"), t(0));
        let later = engine.evaluate_at(&change("b.md"), t(20));

        assert_eq!(later.action, GroupAction::Group);
        assert_ne!(later.group_id, first.group_id);
    }

    #[test]
    fn test_capacity_reached_merges() {
        let engine = engine(GroupingConfig {
            max_active_groups: 1,
            ..Default::default()
        });
        engine.evaluate_at(&change("a.md"), t(0));
        let other_type = NotificationRequest::new("error", "ops", Priority::Normal, json!({}));
        let decision = engine.evaluate_at(&other_type, t(1));

        assert_eq!(decision.action, GroupAction::Merge);
        assert!(!decision.should_group);
        assert_eq!(decision.group_id, None);
        assert_eq!(engine.stats_at(t(1)).counters.merged, 1);
    }

    #[test]
    fn test_capacity_frees_after_expiry() {
        let engine = engine(GroupingConfig {
            max_active_groups: 1,
            send_timeout_secs: 10,
            ..Default::default()
        });
        engine.evaluate_at(&change("a.md"), t(0));
        let other_type = NotificationRequest::new("error", "ops", Priority::Normal, json!({}));

        // expiry age is 30s
        let decision = engine.evaluate_at(&other_type, t(31));
        assert_eq!(decision.action, GroupAction::Group);
        assert_eq!(engine.stats_at(t(31)).counters.groups_expired, 1);
    }

    #[test]
    fn test_bypass_event_type_suppressed() {
        let mut config = GroupingConfig::default();
        config.bypass_event_types.insert("error".to_string());
        let engine = engine(config);

        let decision = engine.evaluate_at(
            &NotificationRequest::new("error", "ops", Priority::High, json!({})),
            t(0),
        );
        assert_eq!(decision.action, GroupAction::Suppress);
        assert_eq!(engine.active_groups(), 0);
    }

    #[test]
    fn test_disabled_engine_suppresses_everything() {
        let engine = engine(GroupingConfig {
            enabled: false,
            ..Default::default()
        });
        assert_eq!(engine.evaluate_at(&change("a.md"), t(0)).action, GroupAction::Suppress);
    }

    #[test]
    fn test_urgent_burst_flushes_early() {
        let engine = engine(GroupingConfig::default());
        let mut high = change("a.md");
        high.priority = Priority::High;
        engine.evaluate_at(&high, t(0));
        assert!(engine.take_ready_groups_at(t(1)).is_empty());

        engine.evaluate_at(&change("b.md"), t(1));
        let ready = engine.take_ready_groups_at(t(2));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].priority, Priority::High);
    }

    #[test]
    fn test_timeout_makes_group_ready() {
        let engine = engine(GroupingConfig::default());
        engine.evaluate_at(&change("a.md"), t(0));

        assert!(engine.take_ready_groups_at(t(59)).is_empty());
        assert_eq!(engine.take_ready_groups_at(t(60)).len(), 1);
    }

    #[test]
    fn test_take_group_and_take_all() {
        let engine = engine(GroupingConfig::default());
        let a = engine.evaluate_at(&change("a.md"), t(0));
        engine.evaluate_at(
            &NotificationRequest::new("error", "ops", Priority::Normal, json!({})),
            t(1),
        );

        let taken = engine.take_group(a.group_id.as_deref().unwrap()).unwrap();
        assert_eq!(taken.event_type, "document_change");
        assert!(engine.take_group("missing").is_none());

        let rest = engine.take_all();
        assert_eq!(rest.len(), 1);
        assert_eq!(engine.active_groups(), 0);
        assert_eq!(engine.stats_at(t(2)).counters.groups_flushed, 2);
    }

    #[test]
    fn test_stats_snapshot() {
        let engine = engine(GroupingConfig::default());
        engine.evaluate_at(&change("a.md"), t(0));
        engine.evaluate_at(&change("b.md"), t(5));

        let stats = engine.stats_at(t(10));
        assert_eq!(stats.active_groups, 1);
        assert_eq!(stats.pending_members, 2);
        assert_eq!(stats.oldest_group_age_secs, Some(10));
        assert_eq!(stats.counters.groups_created, 1);
        assert_eq!(stats.counters.members_added, 1);
    }

    #[test]
    fn test_internal_fault_sends_standalone() {
        let engine = std::sync::Arc::new(engine(GroupingConfig::default()));

        let poisoner = std::sync::Arc::clone(&engine);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.state.lock().unwrap();
            panic!("poison the grouping lock");
        })
        .join();

        let decision = engine.evaluate_at(&change("a.md"), t(0));
        assert_eq!(decision.action, GroupAction::Merge);
        assert!(!decision.should_group);
    }
}
