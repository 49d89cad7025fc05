//! 通知分发器 - 串联准入控制、分组引擎和投递渠道
//!
//! ```text
//! submit ─▶ AdmissionController ─┬─ BLOCK ─▶ dropped
//!                                ├─ DELAY ─▶ delay queue ─(tick: readmit)─┐
//!                                └─ ALLOW ─▶ GroupingEngine ◀─────────────┘
//!                                              ├─ GROUP ─▶ held until the group is ready
//!                                              ├─ ESCALATE ─▶ flush group, send event
//!                                              └─ MERGE / SUPPRESS ─▶ send event
//! ```

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::channel::{DeliveryChannel, PayloadRenderer, SendResult};
use super::formatter::TextRenderer;
use super::{NotificationRequest, Priority};
use crate::grouping::{GroupAction, GroupingEngine, MessageGroup, SummarizerRegistry};
use crate::throttle::{AdmissionController, ThrottleAction, ThrottleDecision};

/// What happened to one submitted request
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Delivered on its own
    Sent(Vec<(String, SendResult)>),
    /// Held in a group
    Grouped { group_id: String },
    /// Its group was full or overdue; the group was flushed and the request sent on its own
    Escalated {
        group_id: String,
        results: Vec<(String, SendResult)>,
    },
    /// Held in the delay queue
    Delayed { wake_at: DateTime<Utc> },
    /// Rejected by admission control
    Blocked { reason: String },
}

/// Deliveries produced by one `tick`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// Delayed requests that passed re-admission this tick
    pub released: usize,
    /// Delayed requests still over budget, held again
    pub requeued: usize,
    /// Delayed requests blocked on re-admission
    pub dropped: usize,
    /// Released requests delivered standalone
    pub sent_single: usize,
    /// Group summaries delivered
    pub sent_groups: usize,
}

/// 通知分发器
pub struct NotificationDispatcher {
    admission: Arc<AdmissionController>,
    grouping: Arc<GroupingEngine>,
    summarizers: SummarizerRegistry,
    renderer: Box<dyn PayloadRenderer>,
    /// 所有注册的渠道
    channels: Vec<Arc<dyn DeliveryChannel>>,
    /// 是否为 dry-run 模式
    dry_run: bool,
}

impl NotificationDispatcher {
    pub fn new(admission: Arc<AdmissionController>, grouping: Arc<GroupingEngine>) -> Self {
        Self {
            admission,
            grouping,
            summarizers: SummarizerRegistry::with_builtins(),
            renderer: Box::new(TextRenderer::new()),
            channels: Vec::new(),
            dry_run: false,
        }
    }

    /// 设置 dry-run 模式
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_renderer(mut self, renderer: Box<dyn PayloadRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_summarizers(mut self, summarizers: SummarizerRegistry) -> Self {
        self.summarizers = summarizers;
        self
    }

    /// 注册渠道
    pub fn register_channel(&mut self, channel: Arc<dyn DeliveryChannel>) {
        info!(channel = channel.name(), "Registering delivery channel");
        self.channels.push(channel);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn grouping(&self) -> &Arc<GroupingEngine> {
        &self.grouping
    }

    pub fn submit(&self, request: NotificationRequest) -> DispatchOutcome {
        self.submit_at(request, Utc::now())
    }

    /// Run one request through admission and grouping at an explicit time
    pub fn submit_at(&self, request: NotificationRequest, now: DateTime<Utc>) -> DispatchOutcome {
        let request = request.normalized();
        let decision = self.admission.decide_at(&request, now);

        match decision.action {
            ThrottleAction::Block => {
                debug!(request_id = %request.id, reason = %decision.reason, "Request dropped");
                DispatchOutcome::Blocked {
                    reason: decision.reason,
                }
            }
            ThrottleAction::Delay => {
                let wake_at = wake_time(&decision, now);
                self.admission.enqueue_delayed(request, wake_at);
                DispatchOutcome::Delayed { wake_at }
            }
            ThrottleAction::Allow => self.route(request, now),
        }
    }

    /// Grouping step for an admitted request
    fn route(&self, request: NotificationRequest, now: DateTime<Utc>) -> DispatchOutcome {
        let decision = self.grouping.evaluate_at(&request, now);

        match (decision.action, decision.group_id) {
            (GroupAction::Group, Some(group_id)) => DispatchOutcome::Grouped { group_id },
            (GroupAction::Escalate, Some(group_id)) => {
                if let Some(group) = self.grouping.take_group(&group_id) {
                    self.deliver_group(&group);
                }
                let results = self.deliver_single(&request);
                DispatchOutcome::Escalated { group_id, results }
            }
            _ => DispatchOutcome::Sent(self.deliver_single(&request)),
        }
    }

    pub fn tick(&self) -> TickReport {
        self.tick_at(Utc::now())
    }

    /// Re-admit due delayed requests, then deliver every ready group
    pub fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        for request in self.admission.drain_due(now) {
            let decision = self.admission.readmit_at(&request, now);
            match decision.action {
                ThrottleAction::Allow => {
                    report.released += 1;
                    if let DispatchOutcome::Sent(_) | DispatchOutcome::Escalated { .. } =
                        self.route(request, now)
                    {
                        report.sent_single += 1;
                    }
                }
                ThrottleAction::Delay => {
                    report.requeued += 1;
                    self.admission.enqueue_delayed(request, wake_time(&decision, now));
                }
                ThrottleAction::Block => {
                    report.dropped += 1;
                    debug!(request_id = %request.id, reason = %decision.reason, "Released request dropped");
                }
            }
        }

        for group in self.grouping.take_ready_groups_at(now) {
            self.deliver_group(&group);
            report.sent_groups += 1;
        }

        if report != TickReport::default() {
            debug!(
                released = report.released,
                requeued = report.requeued,
                dropped = report.dropped,
                sent_single = report.sent_single,
                sent_groups = report.sent_groups,
                "Tick delivered"
            );
        }
        report
    }

    /// Deliver every pending group and delayed request, e.g. on shutdown
    pub fn flush_all(&self) -> TickReport {
        self.flush_all_at(Utc::now())
    }

    /// Delayed requests are re-admitted at `now` regardless of their wake time.
    /// Those still over budget are dropped since nothing will tick again.
    pub fn flush_all_at(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        for request in self.admission.drain_due(DateTime::<Utc>::MAX_UTC) {
            let decision = self.admission.readmit_at(&request, now);
            if decision.is_allowed() {
                report.released += 1;
                self.deliver_single(&request);
                report.sent_single += 1;
            } else {
                report.dropped += 1;
                debug!(request_id = %request.id, reason = %decision.reason, "Pending request dropped on flush");
            }
        }

        for group in self.grouping.take_all() {
            self.deliver_group(&group);
            report.sent_groups += 1;
        }

        if report.dropped > 0 {
            warn!(dropped = report.dropped, "Delayed requests over budget were not delivered");
        }
        info!(
            released = report.released,
            sent_groups = report.sent_groups,
            "Flushed pending notifications"
        );
        report
    }

    fn deliver_single(&self, request: &NotificationRequest) -> Vec<(String, SendResult)> {
        let payload = self.renderer.render_request(request);
        self.send_to_channels(&payload, &request.event_type, request.priority)
    }

    fn deliver_group(&self, group: &MessageGroup) -> Vec<(String, SendResult)> {
        let summary = self.summarizers.summarize(group);
        debug!(
            group_id = %summary.group_id,
            count = summary.count,
            title = %summary.title,
            "Delivering group summary"
        );
        let payload = self.renderer.render_summary(&summary);
        self.send_to_channels(&payload, &summary.event_type, summary.priority)
    }

    /// 同步发送到所有渠道
    fn send_to_channels(
        &self,
        payload: &Value,
        event_type: &str,
        priority: Priority,
    ) -> Vec<(String, SendResult)> {
        let mut results = Vec::with_capacity(self.channels.len());

        for channel in &self.channels {
            let name = channel.name().to_string();

            if !channel.should_deliver(priority) {
                results.push((name, SendResult::Skipped("below channel priority".to_string())));
                continue;
            }

            if self.dry_run {
                eprintln!("[DRY-RUN] Would send {} to channel: {}", event_type, name);
                results.push((name, SendResult::Skipped("dry-run".to_string())));
                continue;
            }

            let result = match channel.deliver(payload, event_type) {
                Ok(r) => r,
                Err(e) => {
                    warn!(channel = %name, error = %e, "Channel delivery failed");
                    SendResult::Failed(e.to_string())
                }
            };
            results.push((name, result));
        }

        results
    }
}

/// Absolute wake time for a DELAY decision
fn wake_time(decision: &ThrottleDecision, now: DateTime<Utc>) -> DateTime<Utc> {
    let delay = decision
        .delay
        .and_then(|d| Duration::from_std(d).ok())
        .unwrap_or_else(Duration::zero);
    now + delay
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GroupingConfig, ThrottleConfig};
    use anyhow::Result;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    /// 测试用的 mock 渠道
    struct MockChannel {
        name: String,
        send_count: AtomicUsize,
        kinds: Mutex<Vec<String>>,
    }

    impl MockChannel {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                send_count: AtomicUsize::new(0),
                kinds: Mutex::new(Vec::new()),
            }
        }

        fn get_send_count(&self) -> usize {
            self.send_count.load(Ordering::SeqCst)
        }

        fn kinds(&self) -> Vec<String> {
            self.kinds.lock().unwrap().clone()
        }
    }

    impl DeliveryChannel for MockChannel {
        fn name(&self) -> &str {
            &self.name
        }

        fn deliver(&self, payload: &Value, _event_type: &str) -> Result<SendResult> {
            self.send_count.fetch_add(1, Ordering::SeqCst);
            let kind = payload["kind"].as_str().unwrap_or_default().to_string();
            self.kinds.lock().unwrap().push(kind);
            Ok(SendResult::Sent)
        }
    }

    fn dispatcher(throttle: ThrottleConfig, grouping: GroupingConfig) -> (NotificationDispatcher, Arc<MockChannel>) {
        let admission = Arc::new(AdmissionController::new(throttle).unwrap());
        let engine = Arc::new(GroupingEngine::new(grouping).unwrap());
        let mut dispatcher = NotificationDispatcher::new(admission, engine);
        let channel = Arc::new(MockChannel::new("mock"));
        dispatcher.register_channel(channel.clone());
        (dispatcher, channel)
    }

    fn change(doc: &str) -> NotificationRequest {
        NotificationRequest::new("document_change", "ops", Priority::Normal, json!({"doc_name": doc}))
    }

    #[test]
    fn test_register_channel() {
        let (dispatcher, _) = dispatcher(ThrottleConfig::default(), GroupingConfig::default());
        assert_eq!(dispatcher.channel_count(), 1);
        assert_eq!(dispatcher.channel_names(), vec!["mock"]);
    }

    #[test]
    fn test_grouped_events_flush_as_one_summary() {
        let (dispatcher, channel) = dispatcher(ThrottleConfig::default(), GroupingConfig::default());

        for i in 0..5 {
            let outcome = dispatcher.submit_at(change(&format!("doc{}.md", i)), t(i));
            assert!(matches!(outcome, DispatchOutcome::Grouped { .. }));
        }
        assert_eq!(channel.get_send_count(), 0);

        let report = dispatcher.tick_at(t(5));
        assert_eq!(report.sent_groups, 1);
        assert_eq!(channel.get_send_count(), 1);
        assert_eq!(channel.kinds(), vec!["group"]);
    }

    #[test]
    fn test_duplicate_is_blocked() {
        let (dispatcher, channel) = dispatcher(
            ThrottleConfig::default(),
            GroupingConfig {
                enabled: false,
                ..Default::default()
            },
        );

        let first = dispatcher.submit_at(change("a.md"), t(0));
        let second = dispatcher.submit_at(change("a.md"), t(1));

        assert!(matches!(first, DispatchOutcome::Sent(_)));
        assert!(matches!(second, DispatchOutcome::Blocked { .. }));
        assert_eq!(channel.get_send_count(), 1);
    }

    #[test]
    fn test_escalation_flushes_group_then_sends_event() {
        let (dispatcher, channel) = dispatcher(
            ThrottleConfig::default(),
            GroupingConfig {
                send_timeout_secs: 30,
                ..Default::default()
            },
        );

        dispatcher.submit_at(change("a.md"), t(0));
        let outcome = dispatcher.submit_at(change("b.md"), t(40));

        assert!(matches!(outcome, DispatchOutcome::Escalated { .. }));
        assert_eq!(channel.kinds(), vec!["group", "single"]);
        assert_eq!(dispatcher.grouping().active_groups(), 0);
    }

    #[test]
    fn test_delayed_request_released_on_tick() {
        let throttle = ThrottleConfig::default().with_global_limits(5, 500);
        let (dispatcher, channel) = dispatcher(
            throttle,
            GroupingConfig {
                enabled: false,
                ..Default::default()
            },
        );

        let mut wake_at = None;
        for i in 0..5 {
            let outcome = dispatcher.submit_at(change(&format!("doc{}.md", i)), t(0));
            if let DispatchOutcome::Delayed { wake_at: at } = outcome {
                wake_at = Some(at);
                break;
            }
        }
        let wake_at = wake_at.expect("a request should have been delayed");
        let sent_before = channel.get_send_count();

        assert_eq!(dispatcher.tick_at(t(0)).released, 0);
        let report = dispatcher.tick_at(wake_at);
        assert_eq!(report.released, 1);
        assert_eq!(report.sent_single, 1);
        assert_eq!(channel.get_send_count(), sent_before + 1);
        assert_eq!(dispatcher.tick_at(wake_at).released, 0);
    }

    #[test]
    fn test_released_request_over_budget_is_held_again() {
        let throttle = ThrottleConfig::default().with_global_limits(5, 500);
        let (dispatcher, channel) = dispatcher(
            throttle,
            GroupingConfig {
                enabled: false,
                ..Default::default()
            },
        );

        for i in 0..4 {
            dispatcher.submit_at(change(&format!("doc{}.md", i)), t(0));
        }
        let late = change("late.md");
        dispatcher.admission().enqueue_delayed(late, t(10));

        // the four admitted at t(0) are still inside the minute
        let report = dispatcher.tick_at(t(10));
        assert_eq!(report.requeued, 1);
        assert_eq!(report.released, 0);
        assert_eq!(channel.get_send_count(), 4);
        assert_eq!(dispatcher.admission().next_wake_at(), Some(t(60)));

        let report = dispatcher.tick_at(t(60));
        assert_eq!(report.released, 1);
        assert_eq!(channel.get_send_count(), 5);
    }

    #[test]
    fn test_flush_all_drops_delayed_requests_over_budget() {
        let throttle = ThrottleConfig::default().with_global_limits(5, 500);
        let (dispatcher, channel) = dispatcher(
            throttle,
            GroupingConfig {
                enabled: false,
                ..Default::default()
            },
        );

        for i in 0..4 {
            dispatcher.submit_at(change(&format!("doc{}.md", i)), t(0));
        }
        dispatcher.admission().enqueue_delayed(change("a.md"), t(30));
        dispatcher.admission().enqueue_delayed(change("b.md"), t(40));

        // four of five already spent this minute, at the delay threshold
        let report = dispatcher.flush_all_at(t(1));
        assert_eq!(report.released, 0);
        assert_eq!(report.dropped, 2);
        assert_eq!(channel.get_send_count(), 4);
        assert_eq!(dispatcher.admission().stats_at(t(1)).delayed_pending, 0);
    }

    #[test]
    fn test_dry_run_skips_delivery() {
        let admission = Arc::new(AdmissionController::new(ThrottleConfig::default()).unwrap());
        let engine = Arc::new(
            GroupingEngine::new(GroupingConfig {
                enabled: false,
                ..Default::default()
            })
            .unwrap(),
        );
        let mut dispatcher = NotificationDispatcher::new(admission, engine).with_dry_run(true);
        let channel = Arc::new(MockChannel::new("mock"));
        dispatcher.register_channel(channel.clone());

        let outcome = dispatcher.submit_at(change("a.md"), t(0));
        match outcome {
            DispatchOutcome::Sent(results) => {
                assert_eq!(results[0].1, SendResult::Skipped("dry-run".to_string()));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(channel.get_send_count(), 0); // 不应该实际发送
    }

    #[test]
    fn test_flush_all_delivers_pending_groups() {
        let (dispatcher, channel) = dispatcher(ThrottleConfig::default(), GroupingConfig::default());
        dispatcher.submit_at(change("a.md"), t(0));
        dispatcher.submit_at(
            NotificationRequest::new("error", "ops", Priority::Normal, json!({"message": "boom"})),
            t(1),
        );

        let report = dispatcher.flush_all();
        assert_eq!(report.sent_groups, 2);
        assert_eq!(channel.get_send_count(), 2);
        assert_eq!(dispatcher.grouping().active_groups(), 0);
    }
}
