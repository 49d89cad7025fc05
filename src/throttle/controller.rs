//! Admission controller - five ordered policy layers in front of the delivery channel
//!
//! Layers, short-circuiting on the first non-ALLOW outcome:
//! 1. duplicate detection by content fingerprint
//! 2. global per-minute / per-hour budget (DELAY near the per-minute limit)
//! 3. per-channel budget
//! 4. per-event-type cooldown and budget
//! 5. priority-based load shedding
//!
//! The public entrypoints never fail. An internal fault turns into a logged ALLOW.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use super::decision::{ThrottleAction, ThrottleDecision};
use super::delay_queue::DelayQueue;
use super::duplicate::{DuplicateCache, DuplicateCheck, DUPLICATE_RETENTION_SECS};
use super::history::RateHistory;
use super::stats::{LoadStatus, ThrottleCounters, ThrottleStats};
use crate::config::ThrottleConfig;
use crate::error::{GateError, Result};
use crate::notification::{NotificationRequest, Priority};

/// Percentage of the global per-minute maximum at which requests start being delayed
const DELAY_THRESHOLD_PERCENT: usize = 80;
/// Upper bound for a global-layer delay
const MAX_GLOBAL_DELAY_SECS: f64 = 60.0;
/// Channel over budget: DELAY up to this long, BLOCK beyond
const MAX_CHANNEL_DELAY_SECS: i64 = 30;
/// Upper bound for a load-shedding delay of a HIGH request
const MAX_SHED_DELAY_MS: f64 = 5_000.0;
/// Smallest delay ever handed out
const MIN_DELAY_MS: i64 = 1_000;
/// Inter-arrival samples used for the global delay estimate
const RECENT_INTERVAL_SAMPLES: usize = 10;
/// Minimum spacing between two cleanup passes
const CLEANUP_INTERVAL_SECS: i64 = 300;
/// Buffer size for buckets without a configured maximum
const DEFAULT_HISTORY_CAPACITY: usize = 256;
/// Hard cap on any single history buffer
const MAX_HISTORY_CAPACITY: usize = 100_000;

fn minute() -> Duration {
    Duration::seconds(60)
}

fn hour() -> Duration {
    Duration::seconds(3600)
}

fn to_std(duration: Duration) -> std::time::Duration {
    duration.to_std().unwrap_or_default()
}

fn history_capacity(max: usize) -> usize {
    max.saturating_add(1).min(MAX_HISTORY_CAPACITY)
}

/// Which admission pass a request is going through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    /// First sight, from `decide`
    Submitted,
    /// Released from the delay queue, from `readmit_at`
    Released,
}

struct ThrottleState {
    duplicates: DuplicateCache,
    global: RateHistory,
    channels: HashMap<String, RateHistory>,
    events: HashMap<String, RateHistory>,
    delayed: DelayQueue,
    counters: ThrottleCounters,
    last_cleanup: Option<DateTime<Utc>>,
}

/// 准入控制器
///
/// Construct once and share through `Arc`. All mutable state sits behind one lock
/// that is never held across I/O.
pub struct AdmissionController {
    config: ThrottleConfig,
    state: Mutex<ThrottleState>,
    fail_open: AtomicU64,
}

impl AdmissionController {
    /// Create a controller, rejecting configurations that would divide by zero
    pub fn new(config: ThrottleConfig) -> Result<Self> {
        config.validate()?;

        let global_capacity = history_capacity(
            config
                .global_max_per_hour
                .max(config.global_max_per_minute) as usize,
        );
        let state = ThrottleState {
            duplicates: DuplicateCache::new(config.duplicate_window()),
            global: RateHistory::with_capacity(global_capacity),
            channels: HashMap::new(),
            events: HashMap::new(),
            delayed: DelayQueue::new(),
            counters: ThrottleCounters::default(),
            last_cleanup: None,
        };

        info!(
            global_max_per_minute = config.global_max_per_minute,
            global_max_per_hour = config.global_max_per_hour,
            duplicate_window_secs = config.duplicate_window_secs,
            channel_limits = config.channel_limits.len(),
            event_limits = config.event_limits.len(),
            "Admission controller ready"
        );

        Ok(Self {
            config,
            state: Mutex::new(state),
            fail_open: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Decide on a request at the current time
    pub fn decide(&self, request: &NotificationRequest) -> ThrottleDecision {
        self.decide_at(request, Utc::now())
    }

    /// Decide on a request at an explicit time
    pub fn decide_at(&self, request: &NotificationRequest, now: DateTime<Utc>) -> ThrottleDecision {
        self.decide_or_allow(request, now, Pass::Submitted)
    }

    /// Re-check a DELAYed request once its wake time has passed
    ///
    /// Runs every layer except duplicate detection, which already counted the
    /// request when it was submitted. A request still over budget comes back as
    /// DELAY (hold it again) or BLOCK (drop it).
    pub fn readmit_at(&self, request: &NotificationRequest, now: DateTime<Utc>) -> ThrottleDecision {
        self.decide_or_allow(request, now, Pass::Released)
    }

    fn decide_or_allow(
        &self,
        request: &NotificationRequest,
        now: DateTime<Utc>,
        pass: Pass,
    ) -> ThrottleDecision {
        match self.try_decide(request, now, pass) {
            Ok(decision) => {
                debug!(
                    request_id = %request.id,
                    event_type = %request.event_type,
                    channel = %request.channel,
                    pass = ?pass,
                    action = %decision.action,
                    reason = %decision.reason,
                    "Admission decision"
                );
                decision
            }
            Err(e) => {
                self.fail_open.fetch_add(1, Ordering::Relaxed);
                warn!(
                    request_id = %request.id,
                    error = %e,
                    "Admission check failed, allowing request"
                );
                ThrottleDecision::allow("fail-open: internal error")
            }
        }
    }

    fn try_decide(
        &self,
        request: &NotificationRequest,
        now: DateTime<Utc>,
        pass: Pass,
    ) -> Result<ThrottleDecision> {
        let mut state = self.state.lock()?;
        self.maybe_cleanup(&mut state, now);

        let decision = match self.run_layers(&mut state, request, now, pass)? {
            Some(decision) => decision,
            None => {
                record_histories(&mut state, &self.config, request, now);
                ThrottleDecision::allow("passed all admission checks")
            }
        };

        let counters = &mut state.counters;
        match (pass, decision.action) {
            (Pass::Submitted, action) => {
                counters.total += 1;
                match action {
                    ThrottleAction::Allow => counters.allowed += 1,
                    ThrottleAction::Block => counters.blocked += 1,
                    ThrottleAction::Delay => counters.delayed += 1,
                }
            }
            (Pass::Released, ThrottleAction::Allow) => counters.released += 1,
            (Pass::Released, ThrottleAction::Delay) => counters.requeued += 1,
            (Pass::Released, ThrottleAction::Block) => counters.dropped += 1,
        }
        Ok(decision)
    }

    fn run_layers(
        &self,
        state: &mut ThrottleState,
        request: &NotificationRequest,
        now: DateTime<Utc>,
        pass: Pass,
    ) -> Result<Option<ThrottleDecision>> {
        if pass == Pass::Submitted {
            if let Some(decision) = self.check_duplicate(state, request, now) {
                return Ok(Some(decision));
            }
        }
        if let Some(decision) = self.check_global(state, now)? {
            return Ok(Some(decision));
        }
        if let Some(decision) = self.check_channel(state, request, now) {
            return Ok(Some(decision));
        }
        if let Some(decision) = self.check_event_type(state, request, now) {
            return Ok(Some(decision));
        }
        Ok(self.check_load(state, request, now))
    }

    fn check_duplicate(
        &self,
        state: &mut ThrottleState,
        request: &NotificationRequest,
        now: DateTime<Utc>,
    ) -> Option<ThrottleDecision> {
        let fingerprint = request.fingerprint();
        match state.duplicates.check(&fingerprint, request.priority, now) {
            DuplicateCheck::Fresh | DuplicateCheck::CriticalRepeat { .. } => None,
            DuplicateCheck::Duplicate { occurrences } => {
                state.counters.duplicates += 1;
                Some(ThrottleDecision::block(format!(
                    "duplicate within {}s window (seen {} times)",
                    self.config.duplicate_window_secs, occurrences
                )))
            }
        }
    }

    fn check_global(&self, state: &ThrottleState, now: DateTime<Utc>) -> Result<Option<ThrottleDecision>> {
        let max_minute = self.config.global_max_per_minute as usize;
        let max_hour = self.config.global_max_per_hour as usize;
        if max_minute == 0 || max_hour == 0 {
            return Err(GateError::Configuration(
                "global rate maximum is zero".to_string(),
            ));
        }

        // delayed requests already hold a slot they will claim on release
        let last_minute = state.global.count_in_window(minute(), now);
        let committed = last_minute + state.delayed.len();
        if committed >= max_minute {
            return Ok(Some(ThrottleDecision::block(format!(
                "global rate limit: {}/{} per minute ({} delayed)",
                last_minute,
                max_minute,
                state.delayed.len()
            ))));
        }

        let last_hour = state.global.count_in_window(hour(), now);
        if last_hour + state.delayed.len() >= max_hour {
            return Ok(Some(ThrottleDecision::block(format!(
                "global rate limit: {}/{} per hour",
                last_hour, max_hour
            ))));
        }

        let threshold = delay_threshold(max_minute);
        if last_minute >= threshold {
            let delay = global_delay(state, max_minute, threshold, now);
            return Ok(Some(ThrottleDecision::delay(
                format!(
                    "global rate near limit: {}/{} per minute",
                    last_minute, max_minute
                ),
                to_std(delay),
            )));
        }

        Ok(None)
    }

    fn check_channel(
        &self,
        state: &ThrottleState,
        request: &NotificationRequest,
        now: DateTime<Utc>,
    ) -> Option<ThrottleDecision> {
        let limit = self.config.channel_limits.get(&request.channel)?;
        let history = state.channels.get(&request.channel)?;

        let max_minute = limit.max_per_minute as usize;
        let mut wait = Duration::zero();
        let mut over = None;

        let last_minute = history.count_in_window(minute(), now);
        if last_minute >= max_minute {
            wait = history.time_until_slot(minute(), max_minute, now);
            over = Some(format!("{}/{} per minute", last_minute, max_minute));
        }
        if let Some(max_hour) = limit.max_per_hour.map(|m| m as usize) {
            let last_hour = history.count_in_window(hour(), now);
            if last_hour >= max_hour {
                wait = wait.max(history.time_until_slot(hour(), max_hour, now));
                over = Some(format!("{}/{} per hour", last_hour, max_hour));
            }
        }

        let over = over?;
        if wait <= Duration::seconds(MAX_CHANNEL_DELAY_SECS) {
            let wait = wait.max(Duration::milliseconds(MIN_DELAY_MS));
            Some(ThrottleDecision::delay(
                format!("channel '{}' over budget: {}", request.channel, over),
                to_std(wait),
            ))
        } else {
            Some(ThrottleDecision::block(format!(
                "channel '{}' over budget: {}",
                request.channel, over
            )))
        }
    }

    fn check_event_type(
        &self,
        state: &ThrottleState,
        request: &NotificationRequest,
        now: DateTime<Utc>,
    ) -> Option<ThrottleDecision> {
        let limit = self.config.event_limits.get(&request.event_type)?;
        let history = state.events.get(&request.event_type)?;

        if let (Some(cooldown), Some(last)) = (limit.cooldown_secs.filter(|c| *c > 0), history.last()) {
            let cooldown = Duration::seconds(cooldown as i64);
            let elapsed = now - last;
            if elapsed < cooldown {
                let remaining = cooldown - elapsed;
                return Some(
                    ThrottleDecision::block(format!(
                        "event type '{}' cooling down, {}s remaining",
                        request.event_type,
                        remaining.num_seconds().max(1)
                    ))
                    .with_delay(to_std(remaining)),
                );
            }
        }

        if let Some(max_minute) = limit.max_per_minute.map(|m| m as usize) {
            let last_minute = history.count_in_window(minute(), now);
            if last_minute >= max_minute {
                return Some(ThrottleDecision::block(format!(
                    "event type '{}' rate limit: {}/{} per minute",
                    request.event_type, last_minute, max_minute
                )));
            }
        }

        None
    }

    fn check_load(
        &self,
        state: &ThrottleState,
        request: &NotificationRequest,
        now: DateTime<Utc>,
    ) -> Option<ThrottleDecision> {
        if request.priority == Priority::Critical {
            return None;
        }

        let load = self.current_load(state, now);
        let weight = self.config.priority_weights.weight(request.priority);
        if load <= weight {
            return None;
        }

        let reason = format!(
            "load {:.2} exceeds {} tolerance {:.2}",
            load, request.priority, weight
        );
        if request.priority == Priority::High {
            let delay_ms = (MAX_SHED_DELAY_MS * load).round() as u64;
            Some(ThrottleDecision::delay(
                reason,
                std::time::Duration::from_millis(delay_ms),
            ))
        } else {
            Some(ThrottleDecision::block(reason))
        }
    }

    fn current_load(&self, state: &ThrottleState, now: DateTime<Utc>) -> f64 {
        let max = self.config.global_max_per_minute.max(1) as f64;
        let last_minute = state.global.count_in_window(minute(), now) as f64;
        (last_minute / max).min(1.0)
    }

    /// Hold a DELAYed request until `wake_at`
    pub fn enqueue_delayed(&self, request: NotificationRequest, wake_at: DateTime<Utc>) {
        match self.state.lock() {
            Ok(mut state) => {
                debug!(request_id = %request.id, wake_at = %wake_at, "Request delayed");
                state.delayed.push(request, wake_at);
            }
            Err(e) => warn!(request_id = %request.id, error = %e, "Failed to enqueue delayed request"),
        }
    }

    /// Take every delayed request whose wake time has passed
    pub fn drain_due(&self, now: DateTime<Utc>) -> Vec<NotificationRequest> {
        match self.state.lock() {
            Ok(mut state) => state.delayed.drain_due(now),
            Err(e) => {
                warn!(error = %e, "Failed to drain delay queue");
                Vec::new()
            }
        }
    }

    pub fn next_wake_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().ok()?.delayed.next_wake_at()
    }

    pub fn stats(&self) -> ThrottleStats {
        self.stats_at(Utc::now())
    }

    pub fn stats_at(&self, now: DateTime<Utc>) -> ThrottleStats {
        let fail_open = self.fail_open.load(Ordering::Relaxed);
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        let current_load = self.current_load(&state, now);
        let channel_last_minute: BTreeMap<String, usize> = state
            .channels
            .iter()
            .map(|(channel, history)| (channel.clone(), history.count_in_window(minute(), now)))
            .collect();

        ThrottleStats {
            counters: state.counters,
            fail_open,
            current_load,
            status: LoadStatus::from_load(current_load),
            global_last_minute: state.global.count_in_window(minute(), now),
            global_last_hour: state.global.count_in_window(hour(), now),
            duplicate_entries: state.duplicates.len(),
            delayed_pending: state.delayed.len(),
            channel_last_minute,
        }
    }

    /// Run cleanup now regardless of when it last ran
    pub fn cleanup_at(&self, now: DateTime<Utc>) {
        match self.state.lock() {
            Ok(mut state) => run_cleanup(&mut state, now),
            Err(e) => warn!(error = %e, "Cleanup skipped"),
        }
    }

    fn maybe_cleanup(&self, state: &mut ThrottleState, now: DateTime<Utc>) {
        let due = match state.last_cleanup {
            Some(last) => now - last >= Duration::seconds(CLEANUP_INTERVAL_SECS),
            None => true,
        };
        if due {
            run_cleanup(state, now);
        }
    }
}

fn run_cleanup(state: &mut ThrottleState, now: DateTime<Utc>) {
    let cutoff = now - Duration::seconds(DUPLICATE_RETENTION_SECS);

    let duplicates = state.duplicates.evict_before(cutoff);
    let delayed = state.delayed.evict_before(cutoff);
    for histories in [&mut state.channels, &mut state.events] {
        histories.retain(|_, history| {
            history.prune_before(cutoff);
            !history.is_empty()
        });
    }
    state.global.prune_before(cutoff);

    state.last_cleanup = Some(now);
    state.counters.cleanup_runs += 1;
    if duplicates > 0 || delayed > 0 {
        debug!(duplicates, delayed, "Evicted stale admission state");
    }
}

fn record_histories(
    state: &mut ThrottleState,
    config: &ThrottleConfig,
    request: &NotificationRequest,
    now: DateTime<Utc>,
) {
    state.global.record(now);

    state
        .channels
        .entry(request.channel.clone())
        .or_insert_with(|| {
            let max = config
                .channel_limits
                .get(&request.channel)
                .map(|l| l.max_per_hour.unwrap_or(0).max(l.max_per_minute) as usize);
            RateHistory::with_capacity(max.map_or(DEFAULT_HISTORY_CAPACITY, history_capacity))
        })
        .record(now);

    state
        .events
        .entry(request.event_type.clone())
        .or_insert_with(|| {
            let max = config
                .event_limits
                .get(&request.event_type)
                .and_then(|l| l.max_per_minute)
                .map(|m| m as usize);
            RateHistory::with_capacity(max.map_or(DEFAULT_HISTORY_CAPACITY, history_capacity))
        })
        .record(now);
}

/// Smallest per-minute count at which the global layer starts delaying
fn delay_threshold(max_per_minute: usize) -> usize {
    (max_per_minute * DELAY_THRESHOLD_PERCENT).div_ceil(100).max(1)
}

/// Global DELAY length, capped at `MAX_GLOBAL_DELAY_SECS`
///
/// Never shorter than the spacing estimate or the wait until the minute window
/// drops back under the delay threshold. Requests already queued push it one
/// budgeted interval past the latest wake time.
fn global_delay(
    state: &ThrottleState,
    max_per_minute: usize,
    threshold: usize,
    now: DateTime<Utc>,
) -> Duration {
    let interval = Duration::milliseconds(60_000 / max_per_minute.max(1) as i64);
    let queued = state
        .delayed
        .latest_wake_at()
        .map(|wake_at| wake_at + interval - now)
        .unwrap_or_else(Duration::zero);

    spacing_delay(&state.global, max_per_minute, now)
        .max(state.global.time_until_slot(minute(), threshold, now))
        .max(queued)
        .clamp(
            Duration::milliseconds(MIN_DELAY_MS),
            Duration::seconds(MAX_GLOBAL_DELAY_SECS as i64),
        )
}

/// Delay that brings the recent arrival rate back under `max_per_minute`
///
/// Takes the last few inter-arrival intervals plus the gap since the newest
/// event, and returns how much longer the next event has to wait so that all of
/// them average out to the budgeted spacing.
fn spacing_delay(history: &RateHistory, max_per_minute: usize, now: DateTime<Utc>) -> Duration {
    let target_secs = 60.0 / max_per_minute.max(1) as f64;
    let needed_secs = match history.last() {
        Some(last) => {
            let intervals = history.recent_intervals(RECENT_INTERVAL_SAMPLES);
            let observed: Duration = intervals.iter().fold(now - last, |acc, d| acc + *d);
            let observed_secs = observed.num_milliseconds() as f64 / 1000.0;
            target_secs * (intervals.len() + 1) as f64 - observed_secs
        }
        None => target_secs,
    };

    let min_secs = MIN_DELAY_MS as f64 / 1000.0;
    let secs = needed_secs.clamp(min_secs, MAX_GLOBAL_DELAY_SECS);
    Duration::milliseconds((secs * 1000.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EventLimit, RateLimit};
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Arc;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn request(doc: &str, priority: Priority) -> NotificationRequest {
        NotificationRequest::new("document_change", "ops", priority, json!({"doc_name": doc}))
    }

    fn controller(config: ThrottleConfig) -> AdmissionController {
        AdmissionController::new(config).unwrap()
    }

    #[test]
    fn test_new_rejects_zero_maximum() {
        let config = ThrottleConfig::default().with_global_limits(0, 10);
        assert!(AdmissionController::new(config).is_err());
    }

    #[test]
    fn test_first_request_allowed_and_recorded() {
        let gate = controller(ThrottleConfig::default());
        let decision = gate.decide_at(&request("a.md", Priority::Normal), t(0));

        assert!(decision.is_allowed());
        let stats = gate.stats_at(t(0));
        assert_eq!(stats.global_last_minute, 1);
        assert_eq!(stats.channel_last_minute["ops"], 1);
        assert_eq!(stats.counters.allowed, 1);
    }

    #[test]
    fn test_delay_threshold_rounds_up() {
        assert_eq!(delay_threshold(10), 8);
        assert_eq!(delay_threshold(3), 3);
        assert_eq!(delay_threshold(1), 1);
    }

    #[test]
    fn test_global_delay_near_limit() {
        // 80% of 10 is 8
        let gate = controller(ThrottleConfig::default().with_global_limits(10, 100));
        for i in 0..8 {
            let d = gate.decide_at(&request(&format!("doc-{}", i), Priority::Critical), t(i));
            assert!(d.is_allowed(), "request {} should pass: {:?}", i, d);
        }

        let decision = gate.decide_at(&request("doc-8", Priority::Critical), t(8));
        assert!(decision.is_delayed());
        let delay = decision.delay.unwrap();
        assert!(delay >= std::time::Duration::from_secs(1));
        assert!(delay <= std::time::Duration::from_secs(60));
    }

    #[test]
    fn test_spacing_delay_returns_rate_to_budget() {
        let mut history = RateHistory::with_capacity(20);
        for s in 0..4 {
            history.record(t(s));
        }
        // budget 6/min => 10s spacing; 4 samples spanning 4s need 40s
        assert_eq!(spacing_delay(&history, 6, t(4)), Duration::seconds(36));
        // capped at 60s
        assert_eq!(spacing_delay(&history, 1, t(4)), Duration::seconds(60));
        // already spaced out: minimum delay
        assert_eq!(spacing_delay(&history, 60, t(100)), Duration::seconds(1));
    }

    #[test]
    fn test_global_hour_limit_blocks() {
        let gate = controller(ThrottleConfig::default().with_global_limits(100, 3));
        for i in 0..3 {
            assert!(gate
                .decide_at(&request(&format!("doc-{}", i), Priority::Critical), t(i * 120))
                .is_allowed());
        }
        let decision = gate.decide_at(&request("doc-3", Priority::Critical), t(400));
        assert!(decision.is_blocked());
        assert!(decision.reason.contains("per hour"));
    }

    #[test]
    fn test_channel_over_budget_delays_when_slot_frees_soon() {
        let config = ThrottleConfig::default().with_channel_limit(
            "ops",
            RateLimit {
                max_per_minute: 2,
                max_per_hour: None,
            },
        );
        let gate = controller(config);
        assert!(gate.decide_at(&request("a", Priority::Normal), t(0)).is_allowed());
        assert!(gate.decide_at(&request("b", Priority::Normal), t(40)).is_allowed());

        // slot frees at t=60, 15s away
        let decision = gate.decide_at(&request("c", Priority::Normal), t(45));
        assert!(decision.is_delayed());
        assert_eq!(decision.delay, Some(std::time::Duration::from_secs(15)));
    }

    #[test]
    fn test_channel_over_budget_blocks_when_wait_is_long() {
        let config = ThrottleConfig::default().with_channel_limit(
            "ops",
            RateLimit {
                max_per_minute: 2,
                max_per_hour: None,
            },
        );
        let gate = controller(config);
        assert!(gate.decide_at(&request("a", Priority::Normal), t(0)).is_allowed());
        assert!(gate.decide_at(&request("b", Priority::Normal), t(1)).is_allowed());

        // slot frees at t=60, 55s away
        let decision = gate.decide_at(&request("c", Priority::Normal), t(5));
        assert!(decision.is_blocked());
    }

    #[test]
    fn test_unconfigured_channel_is_unlimited() {
        let config = ThrottleConfig::default()
            .with_global_limits(1000, 10_000)
            .with_channel_limit(
                "other",
                RateLimit {
                    max_per_minute: 1,
                    max_per_hour: None,
                },
            );
        let gate = controller(config);
        for i in 0..20 {
            assert!(gate
                .decide_at(&request(&format!("doc-{}", i), Priority::Normal), t(i))
                .is_allowed());
        }
    }

    #[test]
    fn test_event_cooldown_reports_remaining() {
        let config = ThrottleConfig::default().with_event_limit(
            "document_change",
            EventLimit {
                max_per_minute: None,
                cooldown_secs: Some(30),
            },
        );
        let gate = controller(config);
        assert!(gate.decide_at(&request("a", Priority::Normal), t(0)).is_allowed());

        let decision = gate.decide_at(&request("b", Priority::Normal), t(10));
        assert!(decision.is_blocked());
        assert_eq!(decision.delay, Some(std::time::Duration::from_secs(20)));
        assert!(decision.reason.contains("20s remaining"));

        assert!(gate.decide_at(&request("c", Priority::Normal), t(31)).is_allowed());
    }

    #[test]
    fn test_event_rate_limit_blocks() {
        let config = ThrottleConfig::default().with_event_limit(
            "document_change",
            EventLimit {
                max_per_minute: Some(2),
                cooldown_secs: None,
            },
        );
        let gate = controller(config);
        assert!(gate.decide_at(&request("a", Priority::Normal), t(0)).is_allowed());
        assert!(gate.decide_at(&request("b", Priority::Normal), t(1)).is_allowed());

        let decision = gate.decide_at(&request("c", Priority::Normal), t(2));
        assert!(decision.is_blocked());
        assert!(decision.reason.contains("document_change"));
    }

    #[test]
    fn test_load_shedding_blocks_low_and_delays_high() {
        // six admitted out of 10/min puts load at 0.6, above LOW's 0.5
        let gate = controller(ThrottleConfig::default().with_global_limits(10, 100));
        for i in 0..6 {
            assert!(gate
                .decide_at(&request(&format!("doc-{}", i), Priority::Normal), t(i))
                .is_allowed());
        }

        let low = gate.decide_at(&request("low", Priority::Low), t(6));
        assert!(low.is_blocked());
        assert!(low.reason.contains("LOW"));

        let mut weights = crate::config::PriorityWeights::default();
        weights.high = 0.5;
        let mut config = ThrottleConfig::default().with_global_limits(10, 100);
        config.priority_weights = weights;
        let gate = controller(config);
        for i in 0..6 {
            gate.decide_at(&request(&format!("doc-{}", i), Priority::Critical), t(i));
        }
        let high = gate.decide_at(&request("high", Priority::High), t(6));
        assert!(high.is_delayed());
        assert_eq!(high.delay, Some(std::time::Duration::from_millis(3000)));
    }

    #[test]
    fn test_critical_bypasses_load_shedding() {
        let mut config = ThrottleConfig::default().with_global_limits(10, 100);
        config.priority_weights.critical = 0.0;
        let gate = controller(config);
        assert!(gate.decide_at(&request("a", Priority::Critical), t(0)).is_allowed());
        assert!(gate.decide_at(&request("b", Priority::Critical), t(1)).is_allowed());
    }

    #[test]
    fn test_delay_queue_roundtrip() {
        let gate = controller(ThrottleConfig::default());
        gate.enqueue_delayed(request("a", Priority::Normal), t(10));
        gate.enqueue_delayed(request("b", Priority::Normal), t(20));

        assert!(gate.drain_due(t(5)).is_empty());
        assert_eq!(gate.drain_due(t(15)).len(), 1);
        assert_eq!(gate.next_wake_at(), Some(t(20)));
        assert_eq!(gate.drain_due(t(25)).len(), 1);
        assert!(gate.drain_due(t(25)).is_empty());
    }

    #[test]
    fn test_readmit_skips_duplicate_layer() {
        let gate = controller(ThrottleConfig::default());
        let req = request("a", Priority::Normal);
        assert!(gate.decide_at(&req, t(0)).is_allowed());

        // same fingerprint inside the duplicate window
        let decision = gate.readmit_at(&req, t(1));
        assert!(decision.is_allowed());

        let stats = gate.stats_at(t(1));
        assert_eq!(stats.global_last_minute, 2);
        assert_eq!(stats.counters.released, 1);
        assert_eq!(stats.counters.total, 1);
    }

    #[test]
    fn test_readmit_delays_again_while_over_budget() {
        let gate = controller(ThrottleConfig::default().with_global_limits(10, 100));
        for i in 0..8 {
            assert!(gate
                .decide_at(&request(&format!("doc-{}", i), Priority::Critical), t(i))
                .is_allowed());
        }

        // still inside the minute that holds all eight
        let decision = gate.readmit_at(&request("late", Priority::Critical), t(30));
        assert!(decision.is_delayed());
        // first slot under the threshold opens when t(0) leaves the window
        assert_eq!(decision.delay, Some(std::time::Duration::from_secs(30)));

        let decision = gate.readmit_at(&request("late", Priority::Critical), t(61));
        assert!(decision.is_allowed());

        let counters = gate.stats_at(t(61)).counters;
        assert_eq!(counters.requeued, 1);
        assert_eq!(counters.released, 1);
    }

    #[test]
    fn test_delayed_requests_count_toward_minute_budget() {
        let gate = controller(ThrottleConfig::default().with_global_limits(10, 100));
        for i in 0..8 {
            gate.decide_at(&request(&format!("doc-{}", i), Priority::Critical), t(0));
        }

        let mut wakes = Vec::new();
        for i in 8..10 {
            let req = request(&format!("doc-{}", i), Priority::Critical);
            let decision = gate.decide_at(&req, t(1));
            assert!(decision.is_delayed(), "request {} should wait: {:?}", i, decision);
            let wake_at = t(1) + Duration::from_std(decision.delay.unwrap()).unwrap();
            gate.enqueue_delayed(req, wake_at);
            wakes.push(wake_at);
        }
        assert!(wakes[1] > wakes[0]);

        // eight admitted plus two queued fill the minute
        let decision = gate.decide_at(&request("doc-10", Priority::Critical), t(1));
        assert!(decision.is_blocked());
        assert!(decision.reason.contains("2 delayed"));
    }

    #[test]
    fn test_internal_fault_fails_open() {
        let gate = Arc::new(controller(ThrottleConfig::default()));

        let poisoner = Arc::clone(&gate);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.state.lock().unwrap();
            panic!("poison the admission lock");
        })
        .join();

        let decision = gate.decide_at(&request("a", Priority::Low), t(0));
        assert!(decision.is_allowed());
        assert_eq!(decision.reason, "fail-open: internal error");
        assert!(gate.readmit_at(&request("b", Priority::Low), t(1)).is_allowed());
        assert_eq!(gate.stats_at(t(1)).fail_open, 2);
    }

    #[test]
    fn test_cleanup_evicts_stale_state() {
        let gate = controller(ThrottleConfig::default());
        gate.decide_at(&request("a", Priority::Normal), t(0));
        gate.enqueue_delayed(request("b", Priority::Normal), t(10));

        gate.cleanup_at(t(4000));
        let stats = gate.stats_at(t(4000));
        assert_eq!(stats.duplicate_entries, 0);
        assert_eq!(stats.delayed_pending, 0);
        assert!(stats.channel_last_minute.is_empty());
    }

    #[test]
    fn test_lazy_cleanup_runs_at_most_every_five_minutes() {
        let gate = controller(ThrottleConfig::default());
        gate.decide_at(&request("a", Priority::Normal), t(0));
        gate.decide_at(&request("b", Priority::Normal), t(100));
        assert_eq!(gate.stats_at(t(100)).counters.cleanup_runs, 1);

        gate.decide_at(&request("c", Priority::Normal), t(300));
        assert_eq!(gate.stats_at(t(300)).counters.cleanup_runs, 2);
    }

    #[test]
    fn test_stats_status_label() {
        let gate = controller(ThrottleConfig::default().with_global_limits(10, 100));
        assert_eq!(gate.stats_at(t(0)).status, LoadStatus::Low);
        for i in 0..5 {
            gate.decide_at(&request(&format!("doc-{}", i), Priority::Critical), t(i));
        }
        let stats = gate.stats_at(t(5));
        assert!((stats.current_load - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.status, LoadStatus::Normal);
    }
}
