//! 消息格式化 - 把单条事件或分组摘要渲染为渠道 payload
//!
//! Payload shape:
//! ```json
//! {"kind": "single" | "group", "event_type": "...", "priority": "HIGH", "text": "...", ...}
//! ```

use serde_json::{json, Value};

use super::channel::PayloadRenderer;
use super::NotificationRequest;
use crate::grouping::GroupSummary;

/// Content keys tried, in order, for the headline of a single event
const HEADLINE_FIELDS: &[&str] = &["title", "message", "error_message", "doc_name", "status"];
const MAX_HEADLINE_CHARS: usize = 200;

/// 文本格式化器
pub struct TextRenderer {
    /// 是否在文本前加优先级标签
    show_priority: bool,
}

impl TextRenderer {
    pub fn new() -> Self {
        Self { show_priority: true }
    }

    pub fn with_show_priority(mut self, show_priority: bool) -> Self {
        self.show_priority = show_priority;
        self
    }

    fn prefix(&self, priority: &str) -> String {
        if self.show_priority {
            format!("[{}] ", priority)
        } else {
            String::new()
        }
    }

    /// 单条事件的一行标题
    pub fn headline(request: &NotificationRequest) -> String {
        let detail = HEADLINE_FIELDS
            .iter()
            .find_map(|key| request.content_field(key))
            .unwrap_or_default();
        let text = match request.project() {
            Some(project) if detail.is_empty() => format!("{} ({})", request.event_type, project),
            Some(project) => format!("{} ({}): {}", request.event_type, project, detail),
            None if detail.is_empty() => request.event_type.clone(),
            None => format!("{}: {}", request.event_type, detail),
        };
        truncate_chars(&text, MAX_HEADLINE_CHARS)
    }
}

impl Default for TextRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadRenderer for TextRenderer {
    fn render_request(&self, request: &NotificationRequest) -> Value {
        let text = format!("{}{}", self.prefix(request.priority.as_str()), Self::headline(request));
        json!({
            "kind": "single",
            "id": request.id,
            "event_type": request.event_type,
            "channel": request.channel,
            "priority": request.priority,
            "text": text,
            "created_at": request.created_at,
        })
    }

    fn render_summary(&self, summary: &GroupSummary) -> Value {
        let mut text = format!("{}{}", self.prefix(summary.priority.as_str()), summary.title);
        for line in &summary.lines {
            text.push_str("\n  - ");
            text.push_str(line);
        }
        json!({
            "kind": "group",
            "group_id": summary.group_id,
            "event_type": summary.event_type,
            "channel": summary.channel,
            "priority": summary.priority,
            "count": summary.count,
            "text": text,
            "first_at": summary.first_at,
            "last_at": summary.last_at,
        })
    }
}

/// 按字符截断，超长时以 "..." 结尾
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", kept)
}
