//! Transient storage: entries live only in memory.

use crate::core::entry::Entry;
use crate::core::error::Result;
use crate::core::storage::queue::{SortedQueue, Tier};
use crate::core::storage::QueueProperty;
use crate::core::storage_id::StorageId;

/// Keeps the entry handle itself as the slot.
#[derive(Debug, Default)]
pub struct RamTier;

impl Tier for RamTier {
    type Slot = Entry;

    fn is_transient(&self) -> bool {
        true
    }

    fn store(&mut self, entry: &Entry) -> Result<Entry> {
        Ok(entry.clone())
    }

    fn load(&self, slot: &Entry) -> Result<Entry> {
        Ok(slot.clone())
    }

    fn replace(&mut self, _old: &Entry, entry: &Entry) -> Result<Entry> {
        Ok(entry.clone())
    }

    fn discard(&mut self, _slots: &[Entry]) -> Result<()> {
        Ok(())
    }

    fn discard_all(&mut self) -> Result<()> {
        Ok(())
    }
}

pub type RamQueue = SortedQueue<RamTier>;

impl SortedQueue<RamTier> {
    pub fn new(storage_id: StorageId, property: QueueProperty) -> Self {
        Self::with_tier(storage_id, property, RamTier, Vec::new())
    }
}
