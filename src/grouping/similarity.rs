//! Token-set similarity between events
//!
//! Tokens come from lower-cased, whitespace-split text assembled from the event
//! type and a fixed set of content keys. Two events are compared with the Jaccard
//! index of their token sets.

use std::collections::HashSet;

use crate::notification::NotificationRequest;

/// Content keys whose text feeds the token set
pub const TOKEN_FIELDS: &[&str] = &["project", "operation", "status", "title", "content"];

/// Token set of one event
pub fn event_tokens(request: &NotificationRequest) -> HashSet<String> {
    let mut text = request.event_type.clone();
    for key in TOKEN_FIELDS {
        if let Some(value) = request.content_field(key) {
            text.push(' ');
            text.push_str(&value);
        }
    }
    tokenize(&text)
}

pub fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Jaccard similarity = |A ∩ B| / |A ∪ B|
///
/// Returns a value in 0.0..=1.0. Two empty sets count as identical.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        return 1.0;
    }
    intersection as f64 / union as f64
}

/// Highest similarity between `tokens` and any of `members`
pub fn best_similarity(tokens: &HashSet<String>, members: &[NotificationRequest]) -> f64 {
    members
        .iter()
        .map(|member| jaccard(tokens, &event_tokens(member)))
        .fold(0.0, f64::max)
}
