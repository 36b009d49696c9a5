//! The one ordered-queue implementation behind every storage kind.
//!
//! [`SortedQueue`] owns the ordered index, the accounting and the listener
//! plumbing; a [`Tier`] decides where entry bodies actually live.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::core::entry::{Entry, OrderKey};
use crate::core::error::{Result, StoreError};
use crate::core::return_data::ReturnDataHolder;
use crate::core::storage::listeners::{EntryFilter, PutListener, SizeListeners, StorageSizeListener};
use crate::core::storage::select::{self, OrderedRows, Row};
use crate::core::storage::{PutOutcome, QueueProperty, Storage, UNKNOWN};
use crate::core::storage_id::StorageId;

/// Where the bodies of a queue's entries are kept.
///
/// All calls happen inside the owning queue's critical section.
pub trait Tier: Send + fmt::Debug + 'static {
    type Slot: Clone + Send + Sync + fmt::Debug;

    fn is_transient(&self) -> bool;

    /// `false` while the durable medium cannot be trusted for counts.
    fn persistent_counts_known(&self) -> bool {
        true
    }

    fn store(&mut self, entry: &Entry) -> Result<Self::Slot>;

    fn load(&self, slot: &Self::Slot) -> Result<Entry>;

    fn replace(&mut self, old: &Self::Slot, entry: &Entry) -> Result<Self::Slot> {
        self.discard(std::slice::from_ref(old))?;
        self.store(entry)
    }

    fn discard(&mut self, slots: &[Self::Slot]) -> Result<()>;

    fn discard_all(&mut self) -> Result<()>;

    fn close(&mut self) {}
}

/// An entry already present in a tier when the queue is opened.
#[derive(Debug, Clone)]
pub struct RecoveredSlot<S> {
    pub key: OrderKey,
    pub size: i64,
    pub persistent: bool,
    pub slot: S,
}

struct Inner<T: Tier> {
    tier: T,
    rows: OrderedRows<T::Slot>,
    ids: HashMap<i64, OrderKey>,
    num_bytes: i64,
    persistent_entries: i64,
    persistent_bytes: i64,
    shutdown: bool,
}

impl<T: Tier> Inner<T> {
    fn ensure_open(&self, storage_id: &StorageId) -> Result<()> {
        if self.shutdown {
            return Err(StoreError::Shutdown(storage_id.clone()));
        }
        Ok(())
    }

    fn insert_row(&mut self, key: OrderKey, row: Row<T::Slot>) {
        self.num_bytes += row.size;
        if row.persistent {
            self.persistent_entries += 1;
            self.persistent_bytes += row.size;
        }
        self.ids.insert(key.unique_id, key);
        self.rows.insert(key, row);
    }

    fn drop_row(&mut self, key: &OrderKey) -> Option<Row<T::Slot>> {
        let row = self.rows.remove(key)?;
        self.ids.remove(&key.unique_id);
        self.num_bytes -= row.size;
        if row.persistent {
            self.persistent_entries -= 1;
            self.persistent_bytes -= row.size;
        }
        Some(row)
    }

    fn materialize(&self, keys: &[OrderKey]) -> Result<Vec<Entry>> {
        keys.iter()
            .filter_map(|k| self.rows.get(k))
            .map(|row| self.tier.load(&row.slot))
            .collect()
    }

    /// Loads, then drops, the given rows. Nothing changes if a load fails.
    fn remove_keys(&mut self, keys: &[OrderKey]) -> Result<Vec<Entry>> {
        let entries = self.materialize(keys)?;
        let slots: Vec<T::Slot> = keys
            .iter()
            .filter_map(|k| self.rows.get(k).map(|r| r.slot.clone()))
            .collect();
        self.tier.discard(&slots)?;
        for key in keys {
            self.drop_row(key);
        }
        Ok(entries)
    }

    fn counts(&self) -> (i64, i64) {
        (self.rows.len() as i64, self.num_bytes)
    }
}

/// Ordered storage over a [`Tier`].
pub struct SortedQueue<T: Tier> {
    storage_id: StorageId,
    property: QueueProperty,
    inner: Mutex<Inner<T>>,
    put_listener: Mutex<Option<Arc<dyn PutListener>>>,
    size_listeners: SizeListeners,
    notify_add_remove: AtomicBool,
}

impl<T: Tier> fmt::Debug for SortedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SortedQueue")
            .field("storage_id", &self.storage_id)
            .field("entries", &inner.rows.len())
            .field("bytes", &inner.num_bytes)
            .field("tier", &inner.tier)
            .finish()
    }
}

impl<T: Tier> SortedQueue<T> {
    pub fn with_tier(
        storage_id: StorageId,
        property: QueueProperty,
        tier: T,
        recovered: Vec<RecoveredSlot<T::Slot>>,
    ) -> Self {
        let mut inner = Inner {
            tier,
            rows: OrderedRows::new(),
            ids: HashMap::new(),
            num_bytes: 0,
            persistent_entries: 0,
            persistent_bytes: 0,
            shutdown: false,
        };
        for r in recovered {
            inner.insert_row(
                r.key,
                Row {
                    size: r.size,
                    persistent: r.persistent,
                    slot: r.slot,
                },
            );
        }
        Self {
            storage_id,
            property,
            inner: Mutex::new(inner),
            put_listener: Mutex::new(None),
            size_listeners: SizeListeners::default(),
            notify_add_remove: AtomicBool::new(false),
        }
    }

    pub fn property(&self) -> &QueueProperty {
        &self.property
    }

    /// Runs `f` against the tier inside the queue's critical section.
    pub fn with_tier_ref<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.lock().tier)
    }

    fn notifies(&self) -> bool {
        self.notify_add_remove.load(Ordering::Acquire)
    }

    fn after_remove(&self, removed: &[Entry], counts: (i64, i64)) {
        if self.notifies() {
            for entry in removed {
                entry.removed(&self.storage_id);
            }
        }
        self.size_listeners.notify(self, counts.0, counts.1, false);
    }

    fn peek_by(
        &self,
        select: impl FnOnce(&OrderedRows<T::Slot>) -> ReturnDataHolder<OrderKey>,
    ) -> Result<Vec<Entry>> {
        let inner = self.inner.lock();
        inner.ensure_open(&self.storage_id)?;
        let selection = select(&inner.rows);
        inner.materialize(&selection.list)
    }

    fn take_by(
        &self,
        select: impl FnOnce(&OrderedRows<T::Slot>) -> ReturnDataHolder<OrderKey>,
    ) -> Result<Vec<Entry>> {
        let (removed, counts) = {
            let mut inner = self.inner.lock();
            inner.ensure_open(&self.storage_id)?;
            let selection = select(&inner.rows);
            if selection.is_empty() {
                return Ok(Vec::new());
            }
            let removed = inner.remove_keys(&selection.list)?;
            (removed, inner.counts())
        };
        self.after_remove(&removed, counts);
        Ok(removed)
    }

    fn check_capacity(&self, inner: &Inner<T>, incoming: i64, incoming_bytes: i64) -> Result<()> {
        let (num_entries, num_bytes) = inner.counts();
        let max_entries = self.property.max_entries;
        let max_bytes = self.property.max_bytes;
        let entries_full = max_entries >= 0 && num_entries + incoming > max_entries;
        let bytes_full = max_bytes >= 0 && num_entries > 0 && num_bytes + incoming_bytes > max_bytes;
        if entries_full || bytes_full {
            return Err(StoreError::QueueFull {
                storage_id: self.storage_id.clone(),
                num_entries,
                max_entries,
                num_bytes,
                max_bytes,
            });
        }
        Ok(())
    }
}

impl<T: Tier> Storage for SortedQueue<T> {
    fn storage_id(&self) -> &StorageId {
        &self.storage_id
    }

    fn is_transient(&self) -> bool {
        self.inner.lock().tier.is_transient()
    }

    fn is_shutdown(&self) -> bool {
        self.inner.lock().shutdown
    }

    fn max_entries(&self) -> i64 {
        self.property.max_entries
    }

    fn max_bytes(&self) -> i64 {
        self.property.max_bytes
    }

    fn num_entries(&self) -> i64 {
        self.inner.lock().rows.len() as i64
    }

    fn num_bytes(&self) -> i64 {
        self.inner.lock().num_bytes
    }

    fn num_persistent_entries(&self) -> i64 {
        let inner = self.inner.lock();
        if inner.tier.persistent_counts_known() {
            inner.persistent_entries
        } else {
            UNKNOWN
        }
    }

    fn num_persistent_bytes(&self) -> i64 {
        let inner = self.inner.lock();
        if inner.tier.persistent_counts_known() {
            inner.persistent_bytes
        } else {
            UNKNOWN
        }
    }

    fn put_all(&self, entries: Vec<Entry>, ignore_put_interceptor: bool) -> Result<PutOutcome> {
        if entries.is_empty() {
            return Ok(PutOutcome::Stored);
        }
        let interceptor = if ignore_put_interceptor {
            None
        } else {
            self.put_listener.lock().clone()
        };
        if let Some(listener) = &interceptor {
            if !listener.put_pre(&entries) {
                debug!(storage_id = %self.storage_id, count = entries.len(), "put vetoed by interceptor");
                return Ok(PutOutcome::Vetoed);
            }
        }

        let (stored, counts) = {
            let mut inner = self.inner.lock();
            inner.ensure_open(&self.storage_id)?;

            let mut fresh = Vec::with_capacity(entries.len());
            for entry in entries {
                let uid = entry.unique_id();
                if inner.ids.contains_key(&uid) || fresh.iter().any(|e: &Entry| e.unique_id() == uid) {
                    warn!(storage_id = %self.storage_id, unique_id = uid, "ignoring put of duplicate unique id");
                    continue;
                }
                fresh.push(entry);
            }
            if fresh.is_empty() {
                return Ok(PutOutcome::Duplicate);
            }
            let incoming_bytes = fresh.iter().map(Entry::size_in_bytes).sum();
            self.check_capacity(&inner, fresh.len() as i64, incoming_bytes)?;

            let mut slots = Vec::with_capacity(fresh.len());
            for entry in &fresh {
                match inner.tier.store(entry) {
                    Ok(slot) => slots.push(slot),
                    Err(e) => {
                        if let Err(rollback) = inner.tier.discard(&slots) {
                            warn!(storage_id = %self.storage_id, error = %rollback, "rollback of partial put failed");
                        }
                        return Err(e);
                    }
                }
            }
            for (entry, slot) in fresh.iter().zip(slots) {
                inner.insert_row(
                    entry.order_key(),
                    Row {
                        size: entry.size_in_bytes(),
                        persistent: entry.is_persistent(),
                        slot,
                    },
                );
            }
            // Hooks run before the lock is released so a concurrent take can
            // never see the entry before its reference is counted.
            if self.notifies() {
                for entry in &fresh {
                    entry.added(&self.storage_id);
                }
            }
            (fresh, inner.counts())
        };

        if let Some(listener) = &interceptor {
            listener.put_post(&stored);
        }
        self.size_listeners.notify(self, counts.0, counts.1, false);
        Ok(PutOutcome::Stored)
    }

    fn update(&self, entry: Entry) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.ensure_open(&self.storage_id)?;
        let key = entry.order_key();
        let Some(old) = inner.drop_row(&key) else {
            return Ok(false);
        };
        match inner.tier.replace(&old.slot, &entry) {
            Ok(slot) => {
                inner.insert_row(
                    key,
                    Row {
                        size: entry.size_in_bytes(),
                        persistent: entry.is_persistent(),
                        slot,
                    },
                );
                Ok(true)
            }
            Err(e) => {
                inner.insert_row(key, old);
                Err(e)
            }
        }
    }

    fn peek_with_priority(
        &self,
        num_entries: i64,
        num_bytes: i64,
        min_priority: i32,
        max_priority: i32,
    ) -> Result<Vec<Entry>> {
        self.peek_by(|rows| select::forward(rows, num_entries, num_bytes, min_priority, max_priority, None))
    }

    fn peek_lowest(
        &self,
        num_entries: i64,
        num_bytes: i64,
        limit_entry: Option<&Entry>,
        leave_one: bool,
    ) -> Result<Vec<Entry>> {
        let limit = limit_entry.map(Entry::order_key);
        self.peek_by(|rows| select::lowest(rows, num_entries, num_bytes, limit, leave_one))
    }

    fn peek_start_at(&self, num_entries: i64, num_bytes: i64, first_exclusive: &Entry) -> Result<Vec<Entry>> {
        let start = first_exclusive.order_key();
        self.peek_by(|rows| select::forward(rows, num_entries, num_bytes, 0, 9, Some(start)))
    }

    fn peek_with_limit_entry(&self, limit_entry: &Entry) -> Result<Vec<Entry>> {
        let limit = limit_entry.order_key();
        self.peek_by(|rows| select::head(rows, limit, false))
    }

    fn fetch(&self, unique_id: i64) -> Result<Option<Entry>> {
        let inner = self.inner.lock();
        let Some(key) = inner.ids.get(&unique_id) else {
            return Ok(None);
        };
        match inner.rows.get(key) {
            Some(row) => inner.tier.load(&row.slot).map(Some),
            None => Ok(None),
        }
    }

    fn take_with_priority(
        &self,
        num_entries: i64,
        num_bytes: i64,
        min_priority: i32,
        max_priority: i32,
    ) -> Result<Vec<Entry>> {
        self.take_by(|rows| select::forward(rows, num_entries, num_bytes, min_priority, max_priority, None))
    }

    fn take_lowest(
        &self,
        num_entries: i64,
        num_bytes: i64,
        limit_entry: Option<&Entry>,
        leave_one: bool,
    ) -> Result<Vec<Entry>> {
        let limit = limit_entry.map(Entry::order_key);
        self.take_by(|rows| select::lowest(rows, num_entries, num_bytes, limit, leave_one))
    }

    fn remove_with_limit_entry(&self, limit_entry: &Entry, inclusive: bool) -> Result<i64> {
        let limit = limit_entry.order_key();
        Ok(self.take_by(|rows| select::head(rows, limit, inclusive))?.len() as i64)
    }

    fn remove_random_all(&self, entries: &[Entry]) -> Result<Vec<bool>> {
        let (flags, removed, counts) = {
            let mut inner = self.inner.lock();
            inner.ensure_open(&self.storage_id)?;
            let flags: Vec<bool> = entries
                .iter()
                .map(|e| inner.rows.contains_key(&e.order_key()))
                .collect();
            let mut keys: Vec<OrderKey> = entries
                .iter()
                .zip(&flags)
                .filter(|(_, present)| **present)
                .map(|(e, _)| e.order_key())
                .collect();
            keys.sort();
            keys.dedup();
            if keys.is_empty() {
                return Ok(flags);
            }
            let removed = inner.remove_keys(&keys)?;
            (flags, removed, inner.counts())
        };
        self.after_remove(&removed, counts);
        Ok(flags)
    }

    fn remove_transient(&self) -> Result<i64> {
        Ok(self
            .take_by(|rows| {
                let mut ret = ReturnDataHolder::new();
                for (key, row) in rows.iter().filter(|(_, r)| !r.persistent) {
                    ret.push(*key, row.size);
                }
                ret
            })?
            .len() as i64)
    }

    fn clear(&self) -> Result<i64> {
        let (removed, count) = {
            let mut inner = self.inner.lock();
            let count = inner.rows.len() as i64;
            let mut removed = Vec::new();
            if self.notifies() {
                for row in inner.rows.values() {
                    match inner.tier.load(&row.slot) {
                        Ok(entry) => removed.push(entry),
                        Err(e) => warn!(storage_id = %self.storage_id, error = %e, "clear: skipping removed hook of unreadable entry"),
                    }
                }
            }
            inner.tier.discard_all()?;
            inner.rows.clear();
            inner.ids.clear();
            inner.num_bytes = 0;
            inner.persistent_entries = 0;
            inner.persistent_bytes = 0;
            (removed, count)
        };
        self.after_remove(&removed, (0, 0));
        Ok(count)
    }

    fn shutdown(&self) {
        let counts = {
            let mut inner = self.inner.lock();
            if inner.shutdown {
                return;
            }
            inner.shutdown = true;
            inner.tier.close();
            inner.counts()
        };
        debug!(storage_id = %self.storage_id, entries = counts.0, "storage shut down");
        self.size_listeners.notify(self, counts.0, counts.1, true);
    }

    fn entry_references(&self) -> Result<Vec<i64>> {
        Ok(self.inner.lock().rows.keys().map(|k| k.unique_id).collect())
    }

    fn entries(&self, filter: Option<&dyn EntryFilter>) -> Result<Vec<Entry>> {
        let all = {
            let inner = self.inner.lock();
            let keys: Vec<OrderKey> = inner.rows.keys().copied().collect();
            inner.materialize(&keys)?
        };
        Ok(match filter {
            Some(filter) => all.into_iter().filter_map(|e| filter.intercept(e)).collect(),
            None => all,
        })
    }

    fn add_put_listener(&self, listener: Arc<dyn PutListener>) -> Result<()> {
        let mut slot = self.put_listener.lock();
        if slot.is_some() {
            return Err(StoreError::PutListenerRegistered(self.storage_id.clone()));
        }
        *slot = Some(listener);
        Ok(())
    }

    fn remove_put_listener(&self, listener: &Arc<dyn PutListener>) {
        let mut slot = self.put_listener.lock();
        if slot.as_ref().is_some_and(|l| Arc::ptr_eq(l, listener)) {
            *slot = None;
        }
    }

    fn add_storage_size_listener(&self, listener: Arc<dyn StorageSizeListener>) {
        self.size_listeners.add(listener);
    }

    fn remove_storage_size_listener(&self, listener: Option<&Arc<dyn StorageSizeListener>>) {
        self.size_listeners.remove(listener);
    }

    fn has_storage_size_listener(&self, listener: Option<&Arc<dyn StorageSizeListener>>) -> bool {
        self.size_listeners.contains(listener)
    }

    fn storage_size_listeners(&self) -> Vec<Arc<dyn StorageSizeListener>> {
        self.size_listeners.snapshot()
    }

    fn set_notified_about_add_or_remove(&self, notify: bool) {
        self.notify_add_remove.store(notify, Ordering::Release);
    }

    fn is_notified_about_add_or_remove(&self) -> bool {
        self.notifies()
    }
}
