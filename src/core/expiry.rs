//! Deadline index for payload lifetimes.
//!
//! Deadlines are kept in millisecond resolution in an ordered map; a sweep
//! pops everything due at or before `now`. Scheduling a key again replaces
//! its previous deadline.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::trace;

#[derive(Debug)]
struct Deadlines<K> {
    by_time: BTreeMap<(u64, u64), K>,
    by_key: HashMap<K, (u64, u64)>,
    next_seq: u64,
}

#[derive(Debug, Default)]
pub struct ExpiryStats {
    pub scheduled: AtomicU64,
    pub cancelled: AtomicU64,
    pub expired: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirySnapshot {
    pub scheduled: u64,
    pub cancelled: u64,
    pub expired: u64,
    pub pending: usize,
    /// Earliest scheduled deadline in epoch milliseconds.
    pub next_deadline: Option<u64>,
}

#[derive(Debug)]
pub struct ExpiryTimer<K> {
    inner: Mutex<Deadlines<K>>,
    stats: ExpiryStats,
}

impl<K: Clone + Eq + Hash> Default for ExpiryTimer<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone + Eq + Hash> ExpiryTimer<K> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Deadlines {
                by_time: BTreeMap::new(),
                by_key: HashMap::new(),
                next_seq: 0,
            }),
            stats: ExpiryStats::default(),
        }
    }

    pub fn schedule(&self, key: K, expires_at_ms: u64) {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        if let Some(previous) = inner.by_key.insert(key.clone(), (expires_at_ms, seq)) {
            inner.by_time.remove(&previous);
        }
        inner.by_time.insert((expires_at_ms, seq), key);
        self.stats.scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cancel(&self, key: &K) -> bool {
        let mut inner = self.inner.lock();
        match inner.by_key.remove(key) {
            Some(slot) => {
                inner.by_time.remove(&slot);
                self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Removes and returns every key due at or before `now_ms`, earliest first.
    pub fn pop_expired(&self, now_ms: u64) -> Vec<K> {
        let mut inner = self.inner.lock();
        let mut due = Vec::new();
        while let Some((&(at, seq), _)) = inner.by_time.first_key_value() {
            if at > now_ms {
                break;
            }
            if let Some(key) = inner.by_time.remove(&(at, seq)) {
                inner.by_key.remove(&key);
                due.push(key);
            }
        }
        if !due.is_empty() {
            trace!(count = due.len(), now_ms, "expiry deadlines reached");
            self.stats.expired.fetch_add(due.len() as u64, Ordering::Relaxed);
        }
        due
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.inner.lock().by_time.keys().next().map(|(at, _)| *at)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> ExpirySnapshot {
        ExpirySnapshot {
            scheduled: self.stats.scheduled.load(Ordering::Relaxed),
            cancelled: self.stats.cancelled.load(Ordering::Relaxed),
            expired: self.stats.expired.load(Ordering::Relaxed),
            pending: self.len(),
            next_deadline: self.next_deadline(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_only_due_keys_in_deadline_order() {
        let timer = ExpiryTimer::new();
        timer.schedule("late", 300);
        timer.schedule("early", 100);
        timer.schedule("mid", 200);
        assert_eq!(timer.pop_expired(250), vec!["early", "mid"]);
        assert_eq!(timer.len(), 1);
        assert_eq!(timer.next_deadline(), Some(300));
    }

    #[test]
    fn rescheduling_replaces_deadline() {
        let timer = ExpiryTimer::new();
        timer.schedule(1u32, 100);
        timer.schedule(1u32, 500);
        assert!(timer.pop_expired(200).is_empty());
        assert_eq!(timer.pop_expired(500), vec![1]);
    }

    #[test]
    fn cancel_removes_deadline() {
        let timer = ExpiryTimer::new();
        timer.schedule(7u32, 10);
        assert!(timer.cancel(&7));
        assert!(!timer.cancel(&7));
        assert!(timer.pop_expired(u64::MAX).is_empty());
        let snap = timer.snapshot();
        assert_eq!((snap.scheduled, snap.cancelled, snap.expired), (1, 1, 0));
        assert_eq!(snap.next_deadline, None);
    }
}
