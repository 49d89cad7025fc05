//! 通知请求 - 生产者提交给准入控制和分组引擎的统一结构

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

use super::fingerprint::generate_fingerprint;
use super::priority::Priority;

static REQUEST_SEQ: AtomicU64 = AtomicU64::new(0);

/// A single event a producer wants delivered to a channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequest {
    /// Request ID (generated when the producer leaves it empty)
    #[serde(default)]
    pub id: String,
    /// Event type, e.g. `document_change`, `sync_progress`, `error`
    pub event_type: String,
    /// Target channel name
    pub channel: String,
    #[serde(default)]
    pub priority: Priority,
    /// Opaque structured payload; only a few known keys are ever read
    #[serde(default)]
    pub content: Value,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl NotificationRequest {
    pub fn new(
        event_type: impl Into<String>,
        channel: impl Into<String>,
        priority: Priority,
        content: Value,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            id: next_request_id(created_at),
            event_type: event_type.into(),
            channel: channel.into(),
            priority,
            content,
            created_at,
        }
    }

    /// 设置 ID
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// 设置创建时间
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Read a content key as text
    ///
    /// Strings are returned as-is, other scalar values through their JSON form.
    /// Missing keys, `null` and non-object content yield `None`.
    pub fn content_field(&self, key: &str) -> Option<String> {
        match self.content.get(key)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Project the event belongs to, if the producer set one
    pub fn project(&self) -> Option<String> {
        self.content_field("project").filter(|p| !p.is_empty())
    }

    /// Content fingerprint used for duplicate detection
    pub fn fingerprint(&self) -> String {
        generate_fingerprint(self)
    }

    /// Fill in fields a JSON producer is allowed to omit
    pub fn normalized(mut self) -> Self {
        if self.id.is_empty() {
            self.id = next_request_id(self.created_at);
        }
        self
    }
}

fn next_request_id(created_at: DateTime<Utc>) -> String {
    let seq = REQUEST_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("req-{}-{}", created_at.timestamp_millis(), seq)
}

/// 请求构建器
#[derive(Debug, Default)]
pub struct NotificationRequestBuilder {
    id: Option<String>,
    event_type: Option<String>,
    channel: Option<String>,
    priority: Option<Priority>,
    content: Option<Value>,
    created_at: Option<DateTime<Utc>>,
}

impl NotificationRequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// 以文本形式设置优先级（经过映射表）
    pub fn priority_label(mut self, label: &str) -> Self {
        self.priority = Some(Priority::from_label(label));
        self
    }

    pub fn content(mut self, content: Value) -> Self {
        self.content = Some(content);
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// 构建请求
    pub fn build(self) -> Result<NotificationRequest, &'static str> {
        let event_type = self.event_type.ok_or("event_type is required")?;
        let channel = self.channel.ok_or("channel is required")?;
        let created_at = self.created_at.unwrap_or_else(Utc::now);

        Ok(NotificationRequest {
            id: self.id.unwrap_or_else(|| next_request_id(created_at)),
            event_type,
            channel,
            priority: self.priority.unwrap_or_default(),
            content: self.content.unwrap_or(Value::Null),
            created_at,
        })
    }
}
