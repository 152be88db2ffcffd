//! BinaryHeap-based deadline queue
//!
//! # Complexity
//!
//! - Insert: O(log n)
//! - Cancel: O(1) (lazy: the heap entry is left behind and skipped)
//! - Pop expired: O(k log n) where k = expired + stale entries
//! - Next deadline: amortized O(1)
//!
//! # Cancellation Strategy
//!
//! The heap only holds `(at, seq, id)`. The live payload sits in a map
//! `id -> (seq, item)`. A heap entry whose `seq` no longer matches the map
//! (cancelled, or superseded by a later insert) is stale and gets dropped
//! when it reaches the front, or when stale entries outnumber live ones
//! and the heap is rebuilt from the map.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use evapi_core::Tstamp;

/// Stale entries tolerated before a rebuild, on top of one per live item.
const COMPACT_SLACK: usize = 64;

/// Heap key (min-heap by deadline, then insertion order)
struct HeapEntry {
    at: Tstamp,
    seq: u64,
    id: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap; equal deadlines fire in insertion order
        match other.at.total_cmp(&self.at) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

/// Deadline queue of items keyed by watcher id.
pub struct TimerQueue<T> {
    heap: BinaryHeap<HeapEntry>,
    live: HashMap<u64, (u64, Tstamp, T)>,
    next_seq: u64,
    total_inserted: u64,
    total_fired: u64,
    total_cancelled: u64,
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self::with_capacity(16)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
            live: HashMap::with_capacity(capacity),
            next_seq: 0,
            total_inserted: 0,
            total_fired: 0,
            total_cancelled: 0,
        }
    }

    /// Schedule `item` under `id` at `at`, replacing any earlier schedule.
    pub fn insert(&mut self, id: u64, at: Tstamp, item: T) -> Option<T> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(HeapEntry { at, seq, id });
        self.total_inserted += 1;
        let old = self.live.insert(id, (seq, at, item)).map(|(_, _, old)| old);
        if self.heap.len() > 2 * self.live.len() + COMPACT_SLACK {
            self.compact();
        }
        old
    }

    /// Rebuild the heap from the live entries, dropping every stale one.
    fn compact(&mut self) {
        self.heap = self
            .live
            .iter()
            .map(|(&id, &(seq, at, _))| HeapEntry { at, seq, id })
            .collect();
    }

    /// Remove `id`. Returns the item if it was scheduled.
    pub fn cancel(&mut self, id: u64) -> Option<T> {
        let removed = self.live.remove(&id).map(|(_, _, item)| item);
        if removed.is_some() {
            self.total_cancelled += 1;
        }
        if self.live.is_empty() {
            self.heap.clear();
        } else if self.heap.len() > 2 * self.live.len() + COMPACT_SLACK {
            self.compact();
        }
        removed
    }

    pub fn contains(&self, id: u64) -> bool {
        self.live.contains_key(&id)
    }

    pub fn get(&self, id: u64) -> Option<&T> {
        self.live.get(&id).map(|(_, _, item)| item)
    }

    /// Deadline currently scheduled for `id`.
    pub fn deadline_of(&self, id: u64) -> Option<Tstamp> {
        self.live.get(&id).map(|(_, at, _)| *at)
    }

    /// Remove and return every item due at or before `now`, earliest first.
    pub fn pop_expired(&mut self, now: Tstamp) -> Vec<(u64, T)> {
        let mut expired = Vec::new();
        while let Some(front) = self.heap.peek() {
            if front.at > now {
                break;
            }
            let Some(entry) = self.heap.pop() else { break };
            match self.live.get(&entry.id) {
                Some((seq, _, _)) if *seq == entry.seq => {}
                _ => continue,
            }
            if let Some((_, _, item)) = self.live.remove(&entry.id) {
                self.total_fired += 1;
                expired.push((entry.id, item));
            }
        }
        expired
    }

    /// Earliest live deadline. Drops stale entries found at the front.
    pub fn next_deadline(&mut self) -> Option<Tstamp> {
        while let Some(front) = self.heap.peek() {
            match self.live.get(&front.id) {
                Some((seq, _, _)) if *seq == front.seq => return Some(front.at),
                _ => {
                    self.heap.pop();
                }
            }
        }
        None
    }

    /// Every live item, in no particular order.
    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.live.values().map(|(_, _, item)| item)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn stats(&self) -> TimerQueueStats {
        TimerQueueStats {
            active: self.live.len(),
            stale: self.heap.len().saturating_sub(self.live.len()),
            total_inserted: self.total_inserted,
            total_fired: self.total_fired,
            total_cancelled: self.total_cancelled,
        }
    }
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics for TimerQueue
#[derive(Debug, Clone)]
pub struct TimerQueueStats {
    /// Live scheduled items
    pub active: usize,
    /// Superseded or cancelled heap entries not yet dropped
    pub stale: usize,
    pub total_inserted: u64,
    pub total_fired: u64,
    pub total_cancelled: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rescheduling_keeps_stale_entries_bounded() {
        let mut q = TimerQueue::new();
        q.insert(1, 1000.0, "idle");
        q.insert(2, 5.0, "other");
        for i in 0..10_000u32 {
            q.insert(1, 1000.0 + f64::from(i), "idle");
            assert!(q.stats().stale <= q.len() + COMPACT_SLACK);
        }
        assert_eq!(q.len(), 2);
        assert_eq!(q.next_deadline(), Some(5.0));
        assert_eq!(q.deadline_of(1), Some(1000.0 + 9_999.0));
        assert_eq!(q.pop_expired(5.0), vec![(2, "other")]);
        assert_eq!(q.pop_expired(20_000.0), vec![(1, "idle")]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_insert_and_pop() {
        let mut q = TimerQueue::new();
        q.insert(42, 1.0, "a");
        assert_eq!(q.len(), 1);
        assert!(q.pop_expired(0.5).is_empty());
        let expired = q.pop_expired(1.0);
        assert_eq!(expired, vec![(42, "a")]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_ordering() {
        let mut q = TimerQueue::new();
        q.insert(3, 0.30, 3);
        q.insert(1, 0.10, 1);
        q.insert(2, 0.20, 2);
        let ids: Vec<u64> = q.pop_expired(1.0).into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_equal_deadlines_fire_in_insert_order() {
        let mut q = TimerQueue::new();
        q.insert(9, 0.5, ());
        q.insert(4, 0.5, ());
        q.insert(7, 0.5, ());
        let ids: Vec<u64> = q.pop_expired(0.5).into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![9, 4, 7]);
    }

    #[test]
    fn test_cancel() {
        let mut q = TimerQueue::new();
        q.insert(1, 1.0, ());
        q.insert(2, 2.0, ());
        assert_eq!(q.cancel(1), Some(()));
        assert_eq!(q.cancel(1), None);
        assert_eq!(q.len(), 1);
        assert_eq!(q.next_deadline(), Some(2.0));
        let expired = q.pop_expired(5.0);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, 2);
    }

    #[test]
    fn test_reinsert_supersedes() {
        let mut q = TimerQueue::new();
        q.insert(1, 1.0, "first");
        let old = q.insert(1, 3.0, "second");
        assert_eq!(old, Some("first"));
        assert_eq!(q.len(), 1);
        assert_eq!(q.deadline_of(1), Some(3.0));
        assert!(q.pop_expired(2.0).is_empty());
        assert_eq!(q.next_deadline(), Some(3.0));
        assert_eq!(q.pop_expired(3.0), vec![(1, "second")]);
    }

    #[test]
    fn test_next_deadline_skips_stale() {
        let mut q = TimerQueue::new();
        assert!(q.next_deadline().is_none());
        q.insert(1, 0.1, ());
        q.insert(2, 0.7, ());
        q.cancel(1);
        assert_eq!(q.next_deadline(), Some(0.7));
        assert_eq!(q.stats().stale, 0);
    }

    #[test]
    fn test_stats() {
        let mut q = TimerQueue::new();
        q.insert(1, 0.0, ());
        q.insert(2, 10.0, ());
        q.pop_expired(1.0);
        q.cancel(2);
        let stats = q.stats();
        assert_eq!(stats.total_inserted, 2);
        assert_eq!(stats.total_fired, 1);
        assert_eq!(stats.total_cancelled, 1);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.stale, 0);
    }
}
