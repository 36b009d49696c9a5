//! The priority-queue contract every backing storage fulfils, and its
//! implementations.
//!
//! Ordering is `(priority desc, unique id asc)`. Every mutating operation runs
//! inside one critical section per storage. `added` hooks run inside it, so an
//! entry is counted before any taker can see it; `removed` hooks and size
//! listeners run after it is released.

pub mod cache;
pub mod journal;
pub mod listeners;
pub mod queue;
pub mod ram;
pub mod registry;
pub(crate) mod select;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::entry::Entry;
use crate::core::error::Result;
use crate::core::priority::Priority;
use crate::core::storage_id::StorageId;

pub use cache::{CacheQueue, CacheTier};
pub use journal::{JournalOptions, JournalQueue, JournalTier, RecoveryReport};
pub use listeners::{EntryFilter, PutListener, StorageSizeListener};
pub use queue::{RecoveredSlot, SortedQueue, Tier};
pub use ram::{RamQueue, RamTier};
pub use registry::StorageRegistry;

/// Returned by counters a backing store cannot currently answer.
pub const UNKNOWN: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    /// The put listener rejected the entries; nothing was stored.
    Vetoed,
    /// Every entry's unique id was already present; the stored ones were kept.
    Duplicate,
}

/// Which backing implementation a storage uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Ram,
    Journal,
    #[default]
    Cache,
}

/// Capacity limits of one storage. Negative values mean unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueProperty {
    pub max_entries: i64,
    pub max_bytes: i64,
    /// Entries kept resident in RAM by a cache storage.
    pub cache_max_entries: i64,
    /// Embedded storages are not watched by threshold rules.
    pub embedded: bool,
}

impl Default for QueueProperty {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_bytes: 10 * 1024 * 1024,
            cache_max_entries: 1000,
            embedded: false,
        }
    }
}

impl QueueProperty {
    pub fn unlimited() -> Self {
        Self {
            max_entries: -1,
            max_bytes: -1,
            cache_max_entries: -1,
            embedded: false,
        }
    }

    pub fn with_max_entries(mut self, max_entries: i64) -> Self {
        self.max_entries = max_entries;
        self
    }
}

/// A priority/age ordered storage of [`Entry`] values.
///
/// `num_entries`/`num_bytes` arguments of `-1` mean unlimited. Peek and take
/// never block and return an empty list when nothing matches.
pub trait Storage: Send + Sync + fmt::Debug {
    fn storage_id(&self) -> &StorageId;

    /// `true` when nothing survives a restart.
    fn is_transient(&self) -> bool;

    fn is_shutdown(&self) -> bool;

    fn max_entries(&self) -> i64;

    fn max_bytes(&self) -> i64;

    fn num_entries(&self) -> i64;

    fn num_bytes(&self) -> i64;

    /// May return [`UNKNOWN`] when the durable tier cannot answer.
    fn num_persistent_entries(&self) -> i64;

    /// May return [`UNKNOWN`] when the durable tier cannot answer.
    fn num_persistent_bytes(&self) -> i64;

    // ───────────────────────────────────────────────────────────
    // Put
    // ───────────────────────────────────────────────────────────

    fn put(&self, entry: Entry, ignore_put_interceptor: bool) -> Result<PutOutcome> {
        self.put_all(vec![entry], ignore_put_interceptor)
    }

    /// Stores all entries or none; capacity is checked for the whole batch.
    fn put_all(&self, entries: Vec<Entry>, ignore_put_interceptor: bool) -> Result<PutOutcome>;

    /// Replaces the stored entry with the same order key. `false` if absent.
    fn update(&self, entry: Entry) -> Result<bool>;

    // ───────────────────────────────────────────────────────────
    // Peek
    // ───────────────────────────────────────────────────────────

    fn peek(&self) -> Result<Option<Entry>> {
        Ok(self.peek_n(1, -1)?.into_iter().next())
    }

    fn peek_n(&self, num_entries: i64, num_bytes: i64) -> Result<Vec<Entry>> {
        self.peek_with_priority(num_entries, num_bytes, Priority::MIN.as_i32(), Priority::MAX.as_i32())
    }

    fn peek_with_priority(
        &self,
        num_entries: i64,
        num_bytes: i64,
        min_priority: i32,
        max_priority: i32,
    ) -> Result<Vec<Entry>>;

    /// Entries sharing the priority of the head entry.
    fn peek_same_priority(&self, num_entries: i64, num_bytes: i64) -> Result<Vec<Entry>> {
        self.peek_with_priority(num_entries, num_bytes, -1, -1)
    }

    /// Entries of lower order than `limit_entry`, lowest first.
    fn peek_lowest(
        &self,
        num_entries: i64,
        num_bytes: i64,
        limit_entry: Option<&Entry>,
        leave_one: bool,
    ) -> Result<Vec<Entry>>;

    /// Entries following `first_exclusive` in delivery order.
    fn peek_start_at(&self, num_entries: i64, num_bytes: i64, first_exclusive: &Entry) -> Result<Vec<Entry>>;

    /// Every entry of higher order than `limit_entry`.
    fn peek_with_limit_entry(&self, limit_entry: &Entry) -> Result<Vec<Entry>>;

    /// Looks up one entry by its unique id.
    fn fetch(&self, unique_id: i64) -> Result<Option<Entry>>;

    // ───────────────────────────────────────────────────────────
    // Take
    // ───────────────────────────────────────────────────────────

    fn take(&self) -> Result<Option<Entry>> {
        Ok(self.take_n(1, -1)?.into_iter().next())
    }

    fn take_n(&self, num_entries: i64, num_bytes: i64) -> Result<Vec<Entry>> {
        self.take_with_priority(num_entries, num_bytes, Priority::MIN.as_i32(), Priority::MAX.as_i32())
    }

    fn take_with_priority(
        &self,
        num_entries: i64,
        num_bytes: i64,
        min_priority: i32,
        max_priority: i32,
    ) -> Result<Vec<Entry>>;

    fn take_same_priority(&self, num_entries: i64, num_bytes: i64) -> Result<Vec<Entry>> {
        self.take_with_priority(num_entries, num_bytes, -1, -1)
    }

    /// Removes entries of lower order than `limit_entry`, lowest first.
    /// With `leave_one` the last remaining entry is never taken.
    fn take_lowest(
        &self,
        num_entries: i64,
        num_bytes: i64,
        limit_entry: Option<&Entry>,
        leave_one: bool,
    ) -> Result<Vec<Entry>>;

    // ───────────────────────────────────────────────────────────
    // Remove
    // ───────────────────────────────────────────────────────────

    fn remove(&self) -> Result<i64> {
        self.remove_num(1)
    }

    fn remove_num(&self, num_entries: i64) -> Result<i64> {
        Ok(self.take_n(num_entries, -1)?.len() as i64)
    }

    fn remove_with_priority(
        &self,
        num_entries: i64,
        num_bytes: i64,
        min_priority: i32,
        max_priority: i32,
    ) -> Result<i64> {
        Ok(self
            .take_with_priority(num_entries, num_bytes, min_priority, max_priority)?
            .len() as i64)
    }

    /// Removes every entry of higher order than `limit_entry`, and
    /// `limit_entry` itself when `inclusive`.
    fn remove_with_limit_entry(&self, limit_entry: &Entry, inclusive: bool) -> Result<i64>;

    /// Removes every entry ahead of `to_entry`, exclusive.
    fn remove_head(&self, to_entry: &Entry) -> Result<i64> {
        self.remove_with_limit_entry(to_entry, false)
    }

    fn remove_random(&self, entry: &Entry) -> Result<bool> {
        Ok(self
            .remove_random_all(std::slice::from_ref(entry))?
            .first()
            .copied()
            .unwrap_or(false))
    }

    /// Parallel flags telling which entries were present and removed.
    fn remove_random_all(&self, entries: &[Entry]) -> Result<Vec<bool>>;

    /// Removes every non-persistent entry.
    fn remove_transient(&self) -> Result<i64>;

    /// Deletes every entry, durable or not, returning how many there were.
    fn clear(&self) -> Result<i64>;

    /// Releases resources; durable entries stay on disk.
    fn shutdown(&self);

    // ───────────────────────────────────────────────────────────
    // Browsing
    // ───────────────────────────────────────────────────────────

    fn entry_references(&self) -> Result<Vec<i64>>;

    fn entries(&self, filter: Option<&dyn EntryFilter>) -> Result<Vec<Entry>>;

    // ───────────────────────────────────────────────────────────
    // Listeners
    // ───────────────────────────────────────────────────────────

    /// At most one put listener; a second registration is an error.
    fn add_put_listener(&self, listener: Arc<dyn PutListener>) -> Result<()>;

    fn remove_put_listener(&self, listener: &Arc<dyn PutListener>);

    fn add_storage_size_listener(&self, listener: Arc<dyn StorageSizeListener>);

    /// `None` removes every size listener.
    fn remove_storage_size_listener(&self, listener: Option<&Arc<dyn StorageSizeListener>>);

    /// `None` asks whether any size listener is registered.
    fn has_storage_size_listener(&self, listener: Option<&Arc<dyn StorageSizeListener>>) -> bool;

    fn storage_size_listeners(&self) -> Vec<Arc<dyn StorageSizeListener>>;

    /// When set, `added`/`removed` hooks fire on entries entering or leaving.
    fn set_notified_about_add_or_remove(&self, notify: bool);

    fn is_notified_about_add_or_remove(&self) -> bool;
}
