//! Group summarizers - reduce a batch to one deliverable summary
//!
//! Summarizers are looked up by event type in a [`SummarizerRegistry`]. New event
//! types are added by registering another summarizer; unregistered types fall back
//! to [`GenericSummarizer`] (member count plus first and last member).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::group::MessageGroup;
use crate::notification::{NotificationRequest, Priority};

/// Longest detail list shown before the rest is folded into "and N more"
const MAX_DETAIL_LINES: usize = 10;

/// 分组摘要
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSummary {
    pub group_id: String,
    pub event_type: String,
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    pub priority: Priority,
    pub count: usize,
    pub title: String,
    pub lines: Vec<String>,
    pub first_at: DateTime<Utc>,
    pub last_at: DateTime<Utc>,
}

impl GroupSummary {
    /// Summary skeleton with everything but the detail lines
    pub fn for_group(group: &MessageGroup, title: impl Into<String>) -> Self {
        let first_at = group.first().map(|m| m.created_at).unwrap_or(group.created_at);
        let last_at = group.last().map(|m| m.created_at).unwrap_or(group.last_updated_at);
        Self {
            group_id: group.group_id.clone(),
            event_type: group.event_type.clone(),
            channel: group.channel.clone(),
            project: group.project.clone(),
            priority: group.priority,
            count: group.len(),
            title: title.into(),
            lines: Vec::new(),
            first_at,
            last_at,
        }
    }

    pub fn with_lines(mut self, lines: Vec<String>) -> Self {
        self.lines = lines;
        self
    }
}

/// Reduces one group to a summary
pub trait GroupSummarizer: Send + Sync {
    fn summarize(&self, group: &MessageGroup) -> GroupSummary;
}

/// Event type → summarizer, with a generic fallback
pub struct SummarizerRegistry {
    summarizers: HashMap<String, Arc<dyn GroupSummarizer>>,
    fallback: Arc<dyn GroupSummarizer>,
}

impl SummarizerRegistry {
    /// Empty registry; every group goes through the fallback
    pub fn new() -> Self {
        Self {
            summarizers: HashMap::new(),
            fallback: Arc::new(GenericSummarizer),
        }
    }

    /// Registry with the built-in summarizers for document, sync and error events
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("document_change", Arc::new(DocumentChangeSummarizer));
        registry.register("sync_progress", Arc::new(SyncProgressSummarizer));
        registry.register("error", Arc::new(ErrorSummarizer));
        registry
    }

    /// Register (or replace) the summarizer for an event type
    pub fn register(&mut self, event_type: impl Into<String>, summarizer: Arc<dyn GroupSummarizer>) {
        self.summarizers.insert(event_type.into(), summarizer);
    }

    pub fn set_fallback(&mut self, summarizer: Arc<dyn GroupSummarizer>) {
        self.fallback = summarizer;
    }

    pub fn is_registered(&self, event_type: &str) -> bool {
        self.summarizers.contains_key(event_type)
    }

    pub fn summarize(&self, group: &MessageGroup) -> GroupSummary {
        self.summarizers
            .get(&group.event_type)
            .unwrap_or(&self.fallback)
            .summarize(group)
    }
}

impl Default for SummarizerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn describe(member: &NotificationRequest) -> String {
    member
        .content_field("title")
        .or_else(|| member.content_field("message"))
        .or_else(|| member.content_field("doc_name"))
        .unwrap_or_else(|| member.event_type.clone())
}

/// Keep at most `MAX_DETAIL_LINES`, folding the rest into one line
fn fold_lines(mut lines: Vec<String>) -> Vec<String> {
    if lines.len() > MAX_DETAIL_LINES {
        let hidden = lines.len() - MAX_DETAIL_LINES;
        lines.truncate(MAX_DETAIL_LINES);
        lines.push(format!("... and {} more", hidden));
    }
    lines
}

fn project_prefix(group: &MessageGroup) -> String {
    match &group.project {
        Some(project) => format!("[{}] ", project),
        None => String::new(),
    }
}

/// Count plus first and last member
pub struct GenericSummarizer;

impl GroupSummarizer for GenericSummarizer {
    fn summarize(&self, group: &MessageGroup) -> GroupSummary {
        let title = format!(
            "{}{} x{}",
            project_prefix(group),
            group.event_type,
            group.len()
        );
        let mut lines = Vec::new();
        if let Some(first) = group.first() {
            lines.push(format!("first: {}", describe(first)));
        }
        if group.len() > 1 {
            if let Some(last) = group.last() {
                lines.push(format!("last: {}", describe(last)));
            }
        }
        GroupSummary::for_group(group, title).with_lines(lines)
    }
}

/// Lists changed documents with the operations applied to each
pub struct DocumentChangeSummarizer;

impl GroupSummarizer for DocumentChangeSummarizer {
    fn summarize(&self, group: &MessageGroup) -> GroupSummary {
        // doc name → operations, in first-seen order
        let mut order: Vec<String> = Vec::new();
        let mut operations: HashMap<String, Vec<String>> = HashMap::new();

        for member in &group.members {
            let doc = member
                .content_field("doc_name")
                .unwrap_or_else(|| "(unnamed)".to_string());
            let op = member
                .content_field("operation")
                .unwrap_or_else(|| "changed".to_string());
            let ops = operations.entry(doc.clone()).or_insert_with(|| {
                order.push(doc.clone());
                Vec::new()
            });
            if !ops.contains(&op) {
                ops.push(op);
            }
        }

        let title = format!(
            "{}{} document{} changed",
            project_prefix(group),
            order.len(),
            if order.len() == 1 { "" } else { "s" }
        );
        let lines = order
            .iter()
            .map(|doc| format!("{} ({})", doc, operations[doc].join(", ")))
            .collect();

        GroupSummary::for_group(group, title).with_lines(fold_lines(lines))
    }
}

/// Counts updates per status and reports the latest one
pub struct SyncProgressSummarizer;

impl GroupSummarizer for SyncProgressSummarizer {
    fn summarize(&self, group: &MessageGroup) -> GroupSummary {
        let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
        for member in &group.members {
            let status = member
                .content_field("status")
                .unwrap_or_else(|| "unknown".to_string());
            *by_status.entry(status).or_insert(0) += 1;
        }

        let latest = group.last();
        let route = latest.and_then(|m| {
            let source = m.content_field("source")?;
            let destination = m.content_field("destination")?;
            Some(format!("{} -> {}", source, destination))
        });
        let latest_status = latest
            .and_then(|m| m.content_field("status"))
            .unwrap_or_else(|| "unknown".to_string());

        let title = match route {
            Some(route) => format!(
                "{}sync {}: {} ({} updates)",
                project_prefix(group),
                route,
                latest_status,
                group.len()
            ),
            None => format!(
                "{}sync: {} ({} updates)",
                project_prefix(group),
                latest_status,
                group.len()
            ),
        };
        let lines = by_status
            .into_iter()
            .map(|(status, count)| format!("{}: {}", status, count))
            .collect();

        GroupSummary::for_group(group, title).with_lines(lines)
    }
}

/// Distinct error messages with their repeat counts
pub struct ErrorSummarizer;

impl GroupSummarizer for ErrorSummarizer {
    fn summarize(&self, group: &MessageGroup) -> GroupSummary {
        let mut order: Vec<String> = Vec::new();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for member in &group.members {
            let message = member
                .content_field("error_message")
                .unwrap_or_else(|| describe(member));
            let count = counts.entry(message.clone()).or_insert_with(|| {
                order.push(message.clone());
                0
            });
            *count += 1;
        }

        let title = format!(
            "{}{} error{} ({} distinct)",
            project_prefix(group),
            group.len(),
            if group.len() == 1 { "" } else { "s" },
            order.len()
        );
        let lines = order
            .iter()
            .map(|message| match counts[message] {
                1 => message.clone(),
                n => format!("{} (x{})", message, n),
            })
            .collect();

        GroupSummary::for_group(group, title).with_lines(fold_lines(lines))
    }
}
