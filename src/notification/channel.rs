//! 投递渠道与渲染器 trait 定义

use anyhow::Result;
use serde_json::Value;

use super::{NotificationRequest, Priority};
use crate::grouping::GroupSummary;

/// 发送结果
#[derive(Debug, Clone, PartialEq)]
pub enum SendResult {
    /// 发送成功
    Sent,
    /// 跳过（不符合渠道过滤条件）
    Skipped(String),
    /// 发送失败
    Failed(String),
}

impl SendResult {
    pub fn is_sent(&self) -> bool {
        matches!(self, SendResult::Sent)
    }
}

/// 投递渠道 trait
///
/// Receives an already rendered payload. Implementations report expected
/// failures as `SendResult::Failed` and reserve `Err` for broken setup.
pub trait DeliveryChannel: Send + Sync {
    /// 渠道名称（用于日志和配置）
    fn name(&self) -> &str;

    /// 是否应该发送此优先级的消息
    fn should_deliver(&self, _priority: Priority) -> bool {
        true
    }

    fn deliver(&self, payload: &Value, event_type: &str) -> Result<SendResult>;
}

/// Turns single events and group summaries into channel payloads
pub trait PayloadRenderer: Send + Sync {
    fn render_request(&self, request: &NotificationRequest) -> Value;

    fn render_summary(&self, summary: &GroupSummary) -> Value;
}

/// 检查优先级是否满足最低要求
pub fn priority_meets_threshold(priority: Priority, min_priority: Priority) -> bool {
    priority >= min_priority
}
