//! Fixed-capacity timestamp ring buffer, one per rate bucket

use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

/// Time-ordered timestamps of admitted events for one bucket key
///
/// Insertion is O(1); once the buffer is full the oldest timestamp is evicted.
/// Window counts are only exact while the number of in-window events stays at or
/// below the capacity, so callers size the buffer from the largest maximum they
/// check against.
#[derive(Debug, Clone)]
pub struct RateHistory {
    entries: VecDeque<DateTime<Utc>>,
    capacity: usize,
}

impl RateHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Record an event
    ///
    /// Timestamps within one bucket never go backwards: a timestamp older than
    /// the newest entry is clamped to it. Returns the timestamp actually stored.
    pub fn record(&mut self, at: DateTime<Utc>) -> DateTime<Utc> {
        let at = match self.entries.back() {
            Some(last) if *last > at => *last,
            _ => at,
        };
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(at);
        at
    }

    /// Number of events strictly after `since`
    pub fn count_since(&self, since: DateTime<Utc>) -> usize {
        self.entries.len() - self.entries.partition_point(|t| *t <= since)
    }

    /// Number of events inside the trailing `window` ending at `now`
    pub fn count_in_window(&self, window: Duration, now: DateTime<Utc>) -> usize {
        self.count_since(now - window)
    }

    pub fn last(&self) -> Option<DateTime<Utc>> {
        self.entries.back().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Intervals between consecutive entries, newest last, at most `samples` of them
    pub fn recent_intervals(&self, samples: usize) -> Vec<Duration> {
        let len = self.entries.len();
        if len < 2 {
            return Vec::new();
        }
        let start = len.saturating_sub(samples + 1);
        self.entries
            .range(start..)
            .zip(self.entries.range(start + 1..))
            .map(|(a, b)| *b - *a)
            .collect()
    }

    /// How long until the trailing `window` holds fewer than `max` events
    ///
    /// Zero when the window already has room.
    pub fn time_until_slot(&self, window: Duration, max: usize, now: DateTime<Utc>) -> Duration {
        let in_window = self.count_in_window(window, now);
        if in_window < max {
            return Duration::zero();
        }
        let first_in_window = self.entries.len() - in_window;
        let must_expire = self.entries[first_in_window + (in_window - max)];
        let wait = must_expire + window - now;
        if wait > Duration::zero() {
            wait
        } else {
            Duration::zero()
        }
    }

    /// Drop every entry at or before `cutoff`
    pub fn prune_before(&mut self, cutoff: DateTime<Utc>) {
        let stale = self.entries.partition_point(|t| *t <= cutoff);
        self.entries.drain(..stale);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_count_in_window() {
        let mut history = RateHistory::with_capacity(10);
        for s in [0, 10, 50, 70] {
            history.record(t(s));
        }

        assert_eq!(history.count_in_window(Duration::seconds(60), t(70)), 2);
        assert_eq!(history.count_in_window(Duration::seconds(3600), t(70)), 4);
        assert_eq!(history.count_in_window(Duration::seconds(60), t(200)), 0);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut history = RateHistory::with_capacity(3);
        for s in 0..5 {
            history.record(t(s));
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.count_since(t(-1)), 3);
        assert_eq!(history.last(), Some(t(4)));
    }

    #[test]
    fn test_out_of_order_timestamp_is_clamped() {
        let mut history = RateHistory::with_capacity(5);
        history.record(t(10));
        let stored = history.record(t(5));

        assert_eq!(stored, t(10));
        assert_eq!(history.last(), Some(t(10)));
    }

    #[test]
    fn test_recent_intervals() {
        let mut history = RateHistory::with_capacity(10);
        for s in [0, 2, 5, 9] {
            history.record(t(s));
        }

        let intervals = history.recent_intervals(2);
        assert_eq!(intervals, vec![Duration::seconds(3), Duration::seconds(4)]);
        assert_eq!(history.recent_intervals(10).len(), 3);
        assert!(RateHistory::with_capacity(4).recent_intervals(3).is_empty());
    }

    #[test]
    fn test_time_until_slot() {
        let mut history = RateHistory::with_capacity(10);
        for s in [0, 20, 40] {
            history.record(t(s));
        }

        // 3 in window, max 3: the entry at t=0 has to age out
        assert_eq!(
            history.time_until_slot(Duration::seconds(60), 3, t(45)),
            Duration::seconds(15)
        );
        // max 2: the entry at t=20 has to age out as well
        assert_eq!(
            history.time_until_slot(Duration::seconds(60), 2, t(45)),
            Duration::seconds(35)
        );
        assert_eq!(
            history.time_until_slot(Duration::seconds(60), 5, t(45)),
            Duration::zero()
        );
    }

    #[test]
    fn test_prune_before() {
        let mut history = RateHistory::with_capacity(10);
        for s in [0, 10, 20] {
            history.record(t(s));
        }
        history.prune_before(t(10));
        assert_eq!(history.len(), 1);

        history.prune_before(t(100));
        assert!(history.is_empty());
    }
}
