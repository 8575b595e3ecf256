//! Outstanding-request tracking.
//!
//! A [`PendingTable`] maps a correlation key to the callers waiting on it.
//! Several callers may wait on one key; resolving the key answers all of
//! them. Tables are owned behind a lock by whoever issues the requests.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::error::MdiError;

/// Receiving half handed to a waiting caller.
pub type Waiter<T> = oneshot::Receiver<Result<T, MdiError>>;

// ── TrackedRequest ────────────────────────────────────────────────

/// Callers waiting on one key.
#[derive(Debug)]
struct TrackedRequest<T> {
    waiters: Vec<oneshot::Sender<Result<T, MdiError>>>,
    /// Registration order, used to find the oldest request.
    order: u64,
    sent_at: Instant,
}

// ── PendingTable ──────────────────────────────────────────────────

#[derive(Debug)]
pub struct PendingTable<K, T> {
    requests: HashMap<K, TrackedRequest<T>>,
    next_order: u64,
}

impl<K, T> Default for PendingTable<K, T> {
    fn default() -> Self {
        Self {
            requests: HashMap::new(),
            next_order: 0,
        }
    }
}

impl<K, T> PendingTable<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a waiter for `key`.
    ///
    /// The flag is `true` when the key was not already pending, i.e. the
    /// caller is responsible for issuing the request.
    pub fn register(&mut self, key: K) -> (Waiter<T>, bool) {
        let (tx, rx) = oneshot::channel();
        match self.requests.get_mut(&key) {
            Some(req) => {
                req.waiters.push(tx);
                (rx, false)
            }
            None => {
                let order = self.next_order;
                self.next_order += 1;
                self.requests.insert(
                    key,
                    TrackedRequest {
                        waiters: vec![tx],
                        order,
                        sent_at: Instant::now(),
                    },
                );
                (rx, true)
            }
        }
    }

    /// Answer every waiter on `key`. Returns how many were answered.
    pub fn resolve(&mut self, key: &K, value: T) -> usize {
        let Some(req) = self.requests.remove(key) else {
            return 0;
        };
        let mut waiters = req.waiters;
        let count = waiters.len();
        if let Some(first) = waiters.pop() {
            for tx in waiters {
                let _ = tx.send(Ok(value.clone()));
            }
            let _ = first.send(Ok(value));
        }
        count
    }

    /// Fail every waiter on `key` with the error built by `err`.
    pub fn reject(&mut self, key: &K, err: impl Fn() -> MdiError) -> usize {
        let Some(req) = self.requests.remove(key) else {
            return 0;
        };
        let count = req.waiters.len();
        for tx in req.waiters {
            let _ = tx.send(Err(err()));
        }
        count
    }

    /// Fail the waiters on `key` with `err`. The first waiter receives
    /// `err` itself, any others a [`MdiError::Other`] carrying its text.
    pub fn fail(&mut self, key: &K, err: MdiError) -> usize {
        let Some(req) = self.requests.remove(key) else {
            return 0;
        };
        let count = req.waiters.len();
        let mut waiters = req.waiters.into_iter();
        let first = waiters.next();
        for tx in waiters {
            let _ = tx.send(Err(MdiError::Other(err.to_string())));
        }
        if let Some(tx) = first {
            let _ = tx.send(Err(err));
        }
        count
    }

    /// Fail every outstanding waiter. Returns how many were failed.
    pub fn reject_all(&mut self, err: impl Fn() -> MdiError) -> usize {
        let mut count = 0;
        for (_, req) in self.requests.drain() {
            count += req.waiters.len();
            for tx in req.waiters {
                let _ = tx.send(Err(err()));
            }
        }
        count
    }

    /// Drop waiters whose receiver is gone; removes the key when none remain.
    ///
    /// Returns `true` if the key is no longer pending.
    pub fn prune(&mut self, key: &K) -> bool {
        let Some(req) = self.requests.get_mut(key) else {
            return true;
        };
        req.waiters.retain(|tx| !tx.is_closed());
        if req.waiters.is_empty() {
            self.requests.remove(key);
            true
        } else {
            false
        }
    }

    /// Remove `key` without answering its waiters.
    pub fn remove(&mut self, key: &K) -> bool {
        self.requests.remove(key).is_some()
    }

    /// The key registered earliest among those still pending.
    pub fn oldest(&self) -> Option<K> {
        self.requests
            .iter()
            .min_by_key(|(_, req)| req.order)
            .map(|(key, _)| key.clone())
    }

    /// Oldest key matching `pred`.
    pub fn oldest_where(&self, pred: impl Fn(&K) -> bool) -> Option<K> {
        self.requests
            .iter()
            .filter(|(key, _)| pred(key))
            .min_by_key(|(_, req)| req.order)
            .map(|(key, _)| key.clone())
    }

    /// How long `key` has been outstanding.
    pub fn elapsed(&self, key: &K) -> Option<Duration> {
        self.requests.get(key).map(|req| req.sent_at.elapsed())
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.requests.contains_key(key)
    }

    /// Number of pending keys.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

// ── Tests ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn coalesced_waiters_all_resolve() {
        let mut table: PendingTable<&str, u32> = PendingTable::new();
        let (a, first) = table.register("k");
        let (b, second) = table.register("k");
        assert!(first);
        assert!(!second);
        assert_eq!(table.len(), 1);

        assert_eq!(table.resolve(&"k", 7), 2);
        assert_eq!(a.await.unwrap().unwrap(), 7);
        assert_eq!(b.await.unwrap().unwrap(), 7);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn reject_all_fails_everyone() {
        let mut table: PendingTable<u64, ()> = PendingTable::new();
        let (a, _) = table.register(1);
        let (b, _) = table.register(2);
        assert_eq!(table.reject_all(|| MdiError::Terminated), 2);
        assert!(matches!(a.await.unwrap(), Err(MdiError::Terminated)));
        assert!(matches!(b.await.unwrap(), Err(MdiError::Terminated)));
    }

    #[test]
    fn prune_removes_abandoned_key() {
        let mut table: PendingTable<u64, ()> = PendingTable::new();
        let (a, _) = table.register(1);
        let (b, _) = table.register(1);
        drop(a);
        assert!(!table.prune(&1));
        drop(b);
        assert!(table.prune(&1));
        assert!(!table.is_pending(&1));
    }

    #[test]
    fn oldest_follows_registration_order() {
        let mut table: PendingTable<&str, ()> = PendingTable::new();
        let _a = table.register("b");
        let _b = table.register("a");
        assert_eq!(table.oldest(), Some("b"));
        assert_eq!(table.oldest_where(|k| *k != "b"), Some("a"));
        table.remove(&"b");
        assert_eq!(table.oldest(), Some("a"));
    }

    #[test]
    fn waiter_stays_pending_until_resolved() {
        let mut table: PendingTable<u64, u8> = PendingTable::new();
        let (waiter, _) = table.register(3);
        let mut waiter = tokio_test::task::spawn(waiter);
        tokio_test::assert_pending!(waiter.poll());

        table.resolve(&3, 42);
        assert!(waiter.is_woken());
        let got = tokio_test::assert_ready!(waiter.poll());
        assert_eq!(got.unwrap().unwrap(), 42);
    }

    #[test]
    fn resolve_unknown_key_is_noop() {
        let mut table: PendingTable<u64, u8> = PendingTable::new();
        assert_eq!(table.resolve(&9, 1), 0);
        assert_eq!(table.reject(&9, || MdiError::Terminated), 0);
    }
}
