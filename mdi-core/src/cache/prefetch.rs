//! Sequential-access detection and the prefetch priority queue.
//!
//! Each file keeps a short history of accessed indices. When the last two
//! differ by exactly one, the scan is sequential in that direction and the
//! next `count` indices are queued, nearest first with the highest
//! priority. A new classification replaces the file's earlier requests;
//! any other step clears them.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::cache::SliceKey;

/// Direction of a sequential scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// What the last access says about a file's scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pattern {
    /// Fewer than two accesses recorded.
    Unknown,
    Sequential(Direction),
    Random,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefetchRequest {
    pub key: SliceKey,
    /// Higher is more urgent. The nearest slice gets `prefetch_count`.
    pub priority: u32,
}

#[derive(Debug)]
pub(crate) struct PrefetchQueue {
    count: usize,
    history_len: usize,
    history: HashMap<String, VecDeque<u32>>,
    /// Registered slice counts bounding forward prefetch.
    volumes: HashMap<String, u32>,
    /// Ordered by priority (descending), then enqueue order.
    queue: BTreeMap<(Reverse<u32>, u64), SliceKey>,
    queued: HashMap<SliceKey, (Reverse<u32>, u64)>,
    seq: u64,
}

impl PrefetchQueue {
    pub fn new(count: usize, history_len: usize) -> Self {
        Self {
            count,
            history_len: history_len.max(2),
            history: HashMap::new(),
            volumes: HashMap::new(),
            queue: BTreeMap::new(),
            queued: HashMap::new(),
            seq: 0,
        }
    }

    pub fn register_volume(&mut self, file_id: &str, slice_count: u32) {
        self.volumes.insert(file_id.to_owned(), slice_count);
    }

    /// Record an access and classify the file's scan.
    pub fn record_access(&mut self, key: &SliceKey) -> Pattern {
        let history = self.history.entry(key.file_id.clone()).or_default();
        history.push_back(key.slice_index);
        while history.len() > self.history_len {
            history.pop_front();
        }

        let mut recent = history.iter().rev();
        let (Some(&last), Some(&prev)) = (recent.next(), recent.next()) else {
            return Pattern::Unknown;
        };
        match i64::from(last) - i64::from(prev) {
            1 => Pattern::Sequential(Direction::Forward),
            -1 => Pattern::Sequential(Direction::Backward),
            _ => Pattern::Random,
        }
    }

    /// Indices to fetch after `from` in `direction`, nearest first,
    /// paired with their priority.
    pub fn plan(&self, key: &SliceKey, direction: Direction) -> Vec<(SliceKey, u32)> {
        let limit = self.volumes.get(&key.file_id).copied();
        let mut out = Vec::with_capacity(self.count);
        for step in 1..=self.count {
            let step = step as u32;
            let index = match direction {
                Direction::Forward => key.slice_index.checked_add(step),
                Direction::Backward => key.slice_index.checked_sub(step),
            };
            let Some(index) = index else {
                break;
            };
            if limit.is_some_and(|n| index >= n) {
                break;
            }
            let priority = self.count as u32 + 1 - step;
            out.push((SliceKey::new(key.file_id.clone(), index), priority));
        }
        out
    }

    pub fn push(&mut self, key: SliceKey, priority: u32) -> bool {
        if self.queued.contains_key(&key) {
            return false;
        }
        self.seq += 1;
        let slot = (Reverse(priority), self.seq);
        self.queue.insert(slot, key.clone());
        self.queued.insert(key, slot);
        true
    }

    /// Highest-priority request, oldest first among equals.
    pub fn pop(&mut self) -> Option<PrefetchRequest> {
        let ((Reverse(priority), _), key) = self.queue.pop_first()?;
        self.queued.remove(&key);
        Some(PrefetchRequest { key, priority })
    }

    pub fn remove(&mut self, key: &SliceKey) -> bool {
        match self.queued.remove(key) {
            Some(slot) => {
                self.queue.remove(&slot);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn contains(&self, key: &SliceKey) -> bool {
        self.queued.contains_key(key)
    }

    /// Drop every queued request for `file_id`.
    pub fn drop_file(&mut self, file_id: &str) -> usize {
        let keys: Vec<SliceKey> = self
            .queued
            .keys()
            .filter(|k| k.file_id == file_id)
            .cloned()
            .collect();
        for key in &keys {
            self.remove(key);
        }
        keys.len()
    }

    /// Forget the file's history and queued requests.
    pub fn forget_file(&mut self, file_id: &str) {
        self.history.remove(file_id);
        self.drop_file(file_id);
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.queue.clear();
        self.queued.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn enabled(&self) -> bool {
        self.count > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: u32) -> SliceKey {
        SliceKey::new("vol", i)
    }

    #[test]
    fn classifies_last_two_accesses() {
        let mut q = PrefetchQueue::new(5, 10);
        assert_eq!(q.record_access(&key(10)), Pattern::Unknown);
        assert_eq!(q.record_access(&key(11)), Pattern::Sequential(Direction::Forward));
        assert_eq!(q.record_access(&key(10)), Pattern::Sequential(Direction::Backward));
        assert_eq!(q.record_access(&key(20)), Pattern::Random);
        assert_eq!(q.record_access(&key(20)), Pattern::Random);
    }

    #[test]
    fn history_is_bounded_per_file() {
        let mut q = PrefetchQueue::new(5, 3);
        for i in 0..10 {
            q.record_access(&key(i));
        }
        q.record_access(&SliceKey::new("other", 0));
        assert_eq!(q.history["vol"].len(), 3);
        assert_eq!(q.history["vol"].front(), Some(&7));
        assert_eq!(q.history["other"].len(), 1);
    }

    #[test]
    fn plan_priorities_decrease_with_distance() {
        let q = PrefetchQueue::new(5, 10);
        let plan = q.plan(&key(12), Direction::Forward);
        let got: Vec<(u32, u32)> = plan.iter().map(|(k, p)| (k.slice_index, *p)).collect();
        assert_eq!(got, vec![(13, 5), (14, 4), (15, 3), (16, 2), (17, 1)]);
    }

    #[test]
    fn plan_stops_at_volume_bounds() {
        let mut q = PrefetchQueue::new(5, 10);
        assert_eq!(q.plan(&key(2), Direction::Backward).len(), 2);

        q.register_volume("vol", 15);
        let plan = q.plan(&key(12), Direction::Forward);
        let indices: Vec<u32> = plan.iter().map(|(k, _)| k.slice_index).collect();
        assert_eq!(indices, vec![13, 14]);
    }

    #[test]
    fn pop_in_priority_then_fifo_order() {
        let mut q = PrefetchQueue::new(5, 10);
        q.push(key(1), 2);
        q.push(key(2), 5);
        q.push(key(3), 2);
        assert!(!q.push(key(2), 1));

        let order: Vec<u32> = std::iter::from_fn(|| q.pop()).map(|r| r.key.slice_index).collect();
        assert_eq!(order, vec![2, 1, 3]);
    }

    #[test]
    fn drop_file_keeps_other_files() {
        let mut q = PrefetchQueue::new(5, 10);
        q.push(key(1), 1);
        q.push(SliceKey::new("other", 1), 1);
        assert_eq!(q.drop_file("vol"), 1);
        assert_eq!(q.len(), 1);
        assert!(q.contains(&SliceKey::new("other", 1)));
    }
}
