//! Blocking peek/take over any [`Storage`].
//!
//! The wrapper registers a size listener on the storage the first time a call
//! actually has to wait; every put wakes the waiter, and a poll interval
//! re-checks in case notifications are suppressed.
//!
//! One wrapper coordinates a single waiter. Several threads blocking on the
//! same wrapper all wake on every change and race for the entries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::core::entry::Entry;
use crate::core::error::{Result, StoreError};
use crate::core::storage::{Storage, StorageSizeListener};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Default)]
struct WakeState {
    generation: u64,
    detached: bool,
}

#[derive(Debug, Default)]
struct WakeSignal {
    state: Mutex<WakeState>,
    cond: Condvar,
}

impl WakeSignal {
    fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    fn bump(&self) {
        self.state.lock().generation += 1;
        self.cond.notify_all();
    }

    fn detach(&self) {
        self.state.lock().detached = true;
        self.cond.notify_all();
    }

    /// Waits until the generation moves past `seen` or `wait` elapses.
    fn wait_changed(&self, seen: u64, wait: Duration) -> Result<()> {
        let mut state = self.state.lock();
        if state.detached {
            return Err(StoreError::StorageGone);
        }
        if state.generation == seen {
            self.cond.wait_for(&mut state, wait);
        }
        if state.detached {
            return Err(StoreError::StorageGone);
        }
        Ok(())
    }
}

impl StorageSizeListener for WakeSignal {
    fn changed(&self, _storage: &dyn Storage, _num_entries: i64, _num_bytes: i64, _is_shutdown: bool) {
        self.bump();
    }
}

#[derive(Debug)]
pub struct BlockingQueueWrapper {
    storage: Mutex<Option<Arc<dyn Storage>>>,
    signal: Arc<WakeSignal>,
    registered: AtomicBool,
    poll_interval: Duration,
}

impl BlockingQueueWrapper {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::with_poll_interval(storage, DEFAULT_POLL_INTERVAL_MS)
    }

    pub fn with_poll_interval(storage: Arc<dyn Storage>, poll_interval_ms: u64) -> Self {
        Self {
            storage: Mutex::new(Some(storage)),
            signal: Arc::new(WakeSignal::default()),
            registered: AtomicBool::new(false),
            poll_interval: Duration::from_millis(poll_interval_ms.max(1)),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn storage(&self) -> Result<Arc<dyn Storage>> {
        self.storage.lock().clone().ok_or(StoreError::StorageGone)
    }

    fn listener(&self) -> Arc<dyn StorageSizeListener> {
        self.signal.clone()
    }

    fn ensure_registered(&self, storage: &Arc<dyn Storage>) {
        if !self.registered.swap(true, Ordering::AcqRel) {
            storage.add_storage_size_listener(self.listener());
            trace!(storage_id = %storage.storage_id(), "blocking wrapper attached");
        }
    }

    /// Detaches from the storage; later calls fail with `StorageGone`.
    pub fn shutdown(&self) {
        let storage = self.storage.lock().take();
        if let Some(storage) = storage {
            if self.registered.swap(false, Ordering::AcqRel) {
                storage.remove_storage_size_listener(Some(&self.listener()));
            }
            debug!(storage_id = %storage.storage_id(), "blocking wrapper shut down");
        }
        self.signal.detach();
    }

    pub fn is_shutdown(&self) -> bool {
        self.storage.lock().is_none()
    }

    /// `timeout_ms`: `0` does not wait, negative waits forever, positive
    /// waits at most that long and then returns what is there.
    fn wait_for(
        &self,
        num_entries: i64,
        timeout_ms: i64,
        mut fetch: impl FnMut(&dyn Storage) -> Result<Vec<Entry>>,
    ) -> Result<Vec<Entry>> {
        let storage = self.storage()?;
        if timeout_ms == 0 {
            return fetch(storage.as_ref());
        }
        self.ensure_registered(&storage);
        let deadline = (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms as u64));

        loop {
            let seen = self.signal.generation();
            let found = fetch(storage.as_ref())?;
            let satisfied = if num_entries < 0 {
                !found.is_empty()
            } else {
                found.len() as i64 >= num_entries
            };
            if satisfied {
                return Ok(found);
            }
            let now = Instant::now();
            let wait = match deadline {
                Some(deadline) if now >= deadline => return Ok(found),
                Some(deadline) => (deadline - now).min(self.poll_interval),
                None => self.poll_interval,
            };
            self.signal.wait_changed(seen, wait)?;
        }
    }

    fn take_after_wait(
        &self,
        found: Vec<Entry>,
        take: impl FnOnce(&dyn Storage, i64) -> Result<Vec<Entry>>,
    ) -> Result<Vec<Entry>> {
        if found.is_empty() {
            return Ok(found);
        }
        let storage = self.storage()?;
        take(storage.as_ref(), found.len() as i64)
    }

    // ───────────────────────────────────────────────────────────
    // Peek
    // ───────────────────────────────────────────────────────────

    pub fn blocking_peek(&self, num_entries: i64, timeout_ms: i64) -> Result<Vec<Entry>> {
        self.wait_for(num_entries, timeout_ms, |s| s.peek_n(num_entries, -1))
    }

    pub fn blocking_peek_with_priority(
        &self,
        num_entries: i64,
        timeout_ms: i64,
        min_priority: i32,
        max_priority: i32,
    ) -> Result<Vec<Entry>> {
        self.wait_for(num_entries, timeout_ms, |s| {
            s.peek_with_priority(num_entries, -1, min_priority, max_priority)
        })
    }

    pub fn blocking_peek_same_priority(&self, num_entries: i64, timeout_ms: i64) -> Result<Vec<Entry>> {
        self.wait_for(num_entries, timeout_ms, |s| s.peek_same_priority(num_entries, -1))
    }

    pub fn blocking_peek_lowest(
        &self,
        num_entries: i64,
        timeout_ms: i64,
        limit_entry: Option<&Entry>,
        leave_one: bool,
    ) -> Result<Vec<Entry>> {
        self.wait_for(num_entries, timeout_ms, |s| {
            s.peek_lowest(num_entries, -1, limit_entry, leave_one)
        })
    }

    // ───────────────────────────────────────────────────────────
    // Take
    // ───────────────────────────────────────────────────────────

    pub fn blocking_take(&self, num_entries: i64, timeout_ms: i64) -> Result<Vec<Entry>> {
        let found = self.blocking_peek(num_entries, timeout_ms)?;
        self.take_after_wait(found, |s, n| s.take_n(n, -1))
    }

    pub fn blocking_take_with_priority(
        &self,
        num_entries: i64,
        timeout_ms: i64,
        min_priority: i32,
        max_priority: i32,
    ) -> Result<Vec<Entry>> {
        let found = self.blocking_peek_with_priority(num_entries, timeout_ms, min_priority, max_priority)?;
        self.take_after_wait(found, |s, n| {
            s.take_with_priority(n, -1, min_priority, max_priority)
        })
    }

    pub fn blocking_take_lowest(
        &self,
        num_entries: i64,
        timeout_ms: i64,
        limit_entry: Option<&Entry>,
        leave_one: bool,
    ) -> Result<Vec<Entry>> {
        let found = self.blocking_peek_lowest(num_entries, timeout_ms, limit_entry, leave_one)?;
        self.take_after_wait(found, |s, n| s.take_lowest(n, -1, limit_entry, leave_one))
    }
}

impl Drop for BlockingQueueWrapper {
    fn drop(&mut self) {
        self.shutdown();
    }
}
