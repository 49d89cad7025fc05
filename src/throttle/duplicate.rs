//! 重复通知缓存 - 按内容指纹识别时间窗口内的重复请求
//!
//! ## 规则
//! 1. 指纹相同且在去重窗口内才算重复
//! 2. 非 CRITICAL 重复请求直接拦截
//! 3. CRITICAL 请求在窗口内最多放行 3 次
//! 4. 超过窗口后计数重置为 1

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::debug;

use crate::notification::Priority;

/// How many times a CRITICAL fingerprint may pass inside one window
pub const MAX_CRITICAL_OCCURRENCES: u32 = 3;

/// Entries idle for longer than this are reclaimed by cleanup
pub const DUPLICATE_RETENTION_SECS: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplicateEntry {
    /// Last time a request with this fingerprint was let through
    pub last_seen_at: DateTime<Utc>,
    /// Occurrences inside the current window, blocked ones included
    pub occurrences: u32,
}

/// Outcome of a duplicate lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateCheck {
    /// Not seen inside the window
    Fresh,
    /// CRITICAL repeat still under the repeat cap
    CriticalRepeat { occurrences: u32 },
    /// Duplicate to be blocked
    Duplicate { occurrences: u32 },
}

/// Fingerprint → (last seen, occurrences)
#[derive(Debug)]
pub struct DuplicateCache {
    entries: HashMap<String, DuplicateEntry>,
    window: Duration,
}

impl DuplicateCache {
    pub fn new(window: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            window,
        }
    }

    /// Classify a fingerprint and update its entry
    pub fn check(&mut self, fingerprint: &str, priority: Priority, now: DateTime<Utc>) -> DuplicateCheck {
        let window = self.window;
        match self.entries.get_mut(fingerprint) {
            Some(entry) if now - entry.last_seen_at < window => {
                entry.occurrences = entry.occurrences.saturating_add(1);
                if priority == Priority::Critical && entry.occurrences <= MAX_CRITICAL_OCCURRENCES {
                    entry.last_seen_at = now;
                    debug!(
                        fingerprint = %fingerprint,
                        occurrences = entry.occurrences,
                        "Critical repeat let through"
                    );
                    DuplicateCheck::CriticalRepeat {
                        occurrences: entry.occurrences,
                    }
                } else {
                    DuplicateCheck::Duplicate {
                        occurrences: entry.occurrences,
                    }
                }
            }
            Some(entry) => {
                entry.last_seen_at = now;
                entry.occurrences = 1;
                DuplicateCheck::Fresh
            }
            None => {
                self.entries.insert(
                    fingerprint.to_string(),
                    DuplicateEntry {
                        last_seen_at: now,
                        occurrences: 1,
                    },
                );
                DuplicateCheck::Fresh
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove entries last seen at or before `cutoff`, returns how many were removed
    pub fn evict_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.last_seen_at > cutoff);
        before - self.entries.len()
    }
}
