//! RAM front with a journal behind it.
//!
//! Persistent entries are always journaled. Up to `cache_max_entries` entries
//! stay resident; transient entries beyond that are swapped to the journal
//! and do not survive a restart.

use std::path::Path;
use std::sync::Arc;

use tracing::trace;

use crate::core::entry::Entry;
use crate::core::error::{Result, StoreError};
use crate::core::factory::EntryFactory;
use crate::core::storage::journal::{journal_path, JournalOptions, JournalSlot, JournalTier};
use crate::core::storage::queue::{RecoveredSlot, SortedQueue, Tier};
use crate::core::storage::{QueueProperty, RecoveryReport};
use crate::core::storage_id::StorageId;

#[derive(Debug, Clone)]
pub struct CacheSlot {
    resident: Option<Entry>,
    on_disk: Option<JournalSlot>,
}

#[derive(Debug)]
pub struct CacheTier {
    journal: JournalTier,
    cache_max_entries: i64,
    resident: i64,
}

impl CacheTier {
    pub fn new(journal: JournalTier, cache_max_entries: i64) -> Self {
        Self {
            journal,
            cache_max_entries,
            resident: 0,
        }
    }

    fn has_room(&self) -> bool {
        self.cache_max_entries < 0 || self.resident < self.cache_max_entries
    }

    pub fn resident_entries(&self) -> i64 {
        self.resident
    }

    pub fn journal(&self) -> &JournalTier {
        &self.journal
    }
}

impl Tier for CacheTier {
    type Slot = CacheSlot;

    fn is_transient(&self) -> bool {
        false
    }

    fn persistent_counts_known(&self) -> bool {
        self.journal.persistent_counts_known()
    }

    fn store(&mut self, entry: &Entry) -> Result<CacheSlot> {
        let resident = self.has_room();
        let on_disk = if entry.is_persistent() || !resident {
            Some(self.journal.store(entry)?)
        } else {
            None
        };
        if resident {
            self.resident += 1;
        } else {
            trace!(unique_id = entry.unique_id(), "cache full, entry swapped to journal");
        }
        Ok(CacheSlot {
            resident: resident.then(|| entry.clone()),
            on_disk,
        })
    }

    fn load(&self, slot: &CacheSlot) -> Result<Entry> {
        match (&slot.resident, &slot.on_disk) {
            (Some(entry), _) => Ok(entry.clone()),
            (None, Some(disk)) => self.journal.load(disk),
            (None, None) => Err(StoreError::Internal("cache slot without a body".into())),
        }
    }

    fn discard(&mut self, slots: &[CacheSlot]) -> Result<()> {
        let on_disk: Vec<JournalSlot> = slots.iter().filter_map(|s| s.on_disk).collect();
        self.journal.discard(&on_disk)?;
        self.resident -= slots.iter().filter(|s| s.resident.is_some()).count() as i64;
        Ok(())
    }

    fn discard_all(&mut self) -> Result<()> {
        self.journal.discard_all()?;
        self.resident = 0;
        Ok(())
    }

    fn close(&mut self) {
        self.journal.close();
    }
}

pub type CacheQueue = SortedQueue<CacheTier>;

impl SortedQueue<CacheTier> {
    /// Opens the cache for `storage_id`; persistent entries come back from
    /// the journal and are loaded lazily.
    pub fn open(
        storage_id: StorageId,
        property: QueueProperty,
        dir: impl AsRef<Path>,
        factory: Arc<EntryFactory>,
        options: JournalOptions,
    ) -> Result<Self> {
        let path = journal_path(dir.as_ref(), &storage_id);
        let options = JournalOptions {
            discard_transient: true,
            ..options
        };
        let (journal, recovered) = JournalTier::open(path, storage_id.clone(), factory, options)?;
        let recovered = recovered
            .into_iter()
            .map(|r| RecoveredSlot {
                key: r.key,
                size: r.size,
                persistent: r.persistent,
                slot: CacheSlot {
                    resident: None,
                    on_disk: Some(r.slot),
                },
            })
            .collect();
        let tier = CacheTier::new(journal, property.cache_max_entries);
        Ok(Self::with_tier(storage_id, property, tier, recovered))
    }

    pub fn recovery_report(&self) -> RecoveryReport {
        self.with_tier_ref(|t| t.journal().report())
    }

    pub fn resident_entries(&self) -> i64 {
        self.with_tier_ref(CacheTier::resident_entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entry::DummyEntry;
    use crate::core::priority::Priority;
    use crate::core::storage::Storage;

    fn open(dir: &Path, cache_max_entries: i64) -> CacheQueue {
        let property = QueueProperty {
            cache_max_entries,
            ..QueueProperty::unlimited()
        };
        CacheQueue::open(
            StorageId::parse("callback:/node/a/client/joe/1").unwrap(),
            property,
            dir,
            Arc::new(EntryFactory::new()),
            JournalOptions::default(),
        )
        .unwrap()
    }

    fn dummy(id: i64, persistent: bool) -> Entry {
        DummyEntry::with_id(Priority::NORM, id, persistent, 10).into()
    }

    #[test]
    fn overflow_is_swapped_and_still_readable() {
        let dir = tempfile::tempdir().unwrap();
        let q = open(dir.path(), 2);
        q.put_all((1..=4).map(|id| dummy(id, false)).collect(), false).unwrap();
        assert_eq!(q.resident_entries(), 2);
        let taken: Vec<i64> = q.take_n(-1, -1).unwrap().iter().map(Entry::unique_id).collect();
        assert_eq!(taken, vec![1, 2, 3, 4]);
        assert_eq!(q.resident_entries(), 0);
    }

    #[test]
    fn only_persistent_entries_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let q = open(dir.path(), 1);
            q.put_all(vec![dummy(1, true), dummy(2, false), dummy(3, false)], false)
                .unwrap();
            q.shutdown();
        }
        let q = open(dir.path(), 1);
        assert_eq!(q.entry_references().unwrap(), vec![1]);
        assert_eq!(q.recovery_report().discarded_transient, 2);
        assert_eq!(q.num_persistent_entries(), 1);
    }
}
