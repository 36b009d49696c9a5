use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::core::entry::Entry;
use crate::core::storage::Storage;

/// Interceptor consulted around every put that does not bypass it.
pub trait PutListener: Send + Sync {
    /// Returning `false` vetoes the whole put.
    fn put_pre(&self, entries: &[Entry]) -> bool;

    /// Called once the entries are stored.
    fn put_post(&self, entries: &[Entry]);
}

/// Notified after the fill level of a storage changed.
///
/// Never called while the storage holds its internal lock, so implementations
/// may call back into the storage.
pub trait StorageSizeListener: Send + Sync {
    fn changed(&self, storage: &dyn Storage, num_entries: i64, num_bytes: i64, is_shutdown: bool);
}

/// Browsing filter; `None` drops the entry from the result.
pub trait EntryFilter {
    fn intercept(&self, entry: Entry) -> Option<Entry>;
}

impl<F> EntryFilter for F
where
    F: Fn(Entry) -> Option<Entry>,
{
    fn intercept(&self, entry: Entry) -> Option<Entry> {
        self(entry)
    }
}

/// Listener registry shared by the storage implementations.
#[derive(Default)]
pub(crate) struct SizeListeners {
    listeners: RwLock<Vec<Arc<dyn StorageSizeListener>>>,
}

impl fmt::Debug for SizeListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SizeListeners")
            .field("count", &self.listeners.read().len())
            .finish()
    }
}

impl SizeListeners {
    pub fn add(&self, listener: Arc<dyn StorageSizeListener>) {
        let mut listeners = self.listeners.write();
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    /// `None` removes every listener.
    pub fn remove(&self, listener: Option<&Arc<dyn StorageSizeListener>>) {
        let mut listeners = self.listeners.write();
        match listener {
            Some(target) => listeners.retain(|l| !Arc::ptr_eq(l, target)),
            None => listeners.clear(),
        }
    }

    /// With `None`, reports whether any listener is registered.
    pub fn contains(&self, listener: Option<&Arc<dyn StorageSizeListener>>) -> bool {
        let listeners = self.listeners.read();
        match listener {
            Some(target) => listeners.iter().any(|l| Arc::ptr_eq(l, target)),
            None => !listeners.is_empty(),
        }
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn StorageSizeListener>> {
        self.listeners.read().clone()
    }

    /// Invokes a snapshot of the listeners; the registry lock is not held
    /// during the calls.
    pub fn notify(&self, storage: &dyn Storage, num_entries: i64, num_bytes: i64, is_shutdown: bool) {
        for listener in self.snapshot() {
            listener.changed(storage, num_entries, num_bytes, is_shutdown);
        }
    }
}
