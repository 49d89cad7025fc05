//! Content fingerprint for duplicate detection
//!
//! The fingerprint covers the event type, the channel and a fixed set of content
//! keys. Free-form message text and unrelated fields are left out, so repeated
//! failures for the same document or sync pair collapse into one fingerprint even
//! when their wording differs.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::request::NotificationRequest;

/// Content keys that take part in the fingerprint, in hashing order
pub const FINGERPRINT_FIELDS: &[&str] = &["doc_name", "source", "destination", "error_message"];

/// Generate a deterministic fingerprint for a request
pub fn generate_fingerprint(request: &NotificationRequest) -> String {
    let canonical = canonical_form(request);
    let mut hasher = DefaultHasher::new();
    canonical.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Build the text that gets hashed
///
/// Absent keys are skipped entirely, present keys are written as `key=value`
/// so that a value can never be confused with a different key's value.
pub fn canonical_form(request: &NotificationRequest) -> String {
    let mut parts = vec![
        format!("event_type={}", request.event_type),
        format!("channel={}", request.channel),
    ];

    for key in FINGERPRINT_FIELDS {
        if let Some(value) = request.content_field(key) {
            parts.push(format!("{}={}", key, value));
        }
    }

    parts.join("\u{1f}")
}
