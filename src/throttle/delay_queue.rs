//! Queue of DELAYed requests ordered by wake time

use chrono::{DateTime, Utc};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::notification::NotificationRequest;

#[derive(Debug, Clone)]
pub struct DelayedEntry {
    pub wake_at: DateTime<Utc>,
    /// Insertion order, breaks ties between equal wake times
    seq: u64,
    pub request: NotificationRequest,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.wake_at == other.wake_at && self.seq == other.seq
    }
}

impl Eq for DelayedEntry {}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.wake_at
            .cmp(&other.wake_at)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Min-heap on wake time; draining never waits
#[derive(Debug, Default)]
pub struct DelayQueue {
    heap: BinaryHeap<Reverse<DelayedEntry>>,
    next_seq: u64,
}

impl DelayQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, request: NotificationRequest, wake_at: DateTime<Utc>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(DelayedEntry {
            wake_at,
            seq,
            request,
        }));
    }

    /// Remove and return every request whose wake time is at or before `now`,
    /// earliest first
    pub fn drain_due(&mut self, now: DateTime<Utc>) -> Vec<NotificationRequest> {
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.wake_at > now {
                break;
            }
            if let Some(Reverse(entry)) = self.heap.pop() {
                due.push(entry.request);
            }
        }
        due
    }

    pub fn next_wake_at(&self) -> Option<DateTime<Utc>> {
        self.heap.peek().map(|Reverse(entry)| entry.wake_at)
    }

    /// Wake time of the entry that wakes last
    pub fn latest_wake_at(&self) -> Option<DateTime<Utc>> {
        self.heap.iter().map(|Reverse(entry)| entry.wake_at).max()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drop entries whose wake time is at or before `cutoff`, returns how many
    pub fn evict_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.heap.len();
        self.heap.retain(|Reverse(entry)| entry.wake_at > cutoff);
        before - self.heap.len()
    }
}
