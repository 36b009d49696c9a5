//! Process-wide `StorageId -> Storage` registry.
//!
//! Storages are created on demand from the configured settings for their id
//! prefix. Queues holding payload references get add/remove notification and
//! every non-embedded storage is offered to the threshold handler.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::config::{QueueSettings, StoreConfig};
use crate::core::error::Result;
use crate::core::events::StorageEventHandler;
use crate::core::factory::EntryFactory;
use crate::core::storage::{CacheQueue, JournalOptions, JournalQueue, RamQueue, Storage, StorageKind};
use crate::core::storage_id::StorageId;

#[derive(Debug)]
pub struct StorageRegistry {
    storages: DashMap<StorageId, Arc<dyn Storage>>,
    factory: Arc<EntryFactory>,
    events: Option<Arc<StorageEventHandler>>,
    directory: PathBuf,
    journal_options: JournalOptions,
    default_queue: QueueSettings,
    queues: HashMap<String, QueueSettings>,
}

impl StorageRegistry {
    pub fn new(
        config: &StoreConfig,
        factory: Arc<EntryFactory>,
        events: Option<Arc<StorageEventHandler>>,
    ) -> Self {
        Self {
            storages: DashMap::new(),
            factory,
            events,
            directory: config.journal.directory.clone(),
            journal_options: JournalOptions {
                fsync_every_n: config.journal.fsync_every_n,
                compact_min_bytes: config.journal.compact_min_bytes,
                discard_transient: false,
            },
            default_queue: config.default_queue,
            queues: config.queues.clone(),
        }
    }

    pub fn settings_for(&self, storage_id: &StorageId) -> QueueSettings {
        self.queues
            .get(storage_id.prefix())
            .copied()
            .unwrap_or(self.default_queue)
    }

    /// Returns the storage for `storage_id`, creating it on first use.
    ///
    /// A new storage is configured before other callers can see it; racing
    /// openers of the same id wait on the map entry and share one instance.
    pub fn open(&self, storage_id: &StorageId) -> Result<Arc<dyn Storage>> {
        if let Some(existing) = self.storages.get(storage_id) {
            return Ok(Arc::clone(existing.value()));
        }
        let vacant = match self.storages.entry(storage_id.clone()) {
            MapEntry::Occupied(occupied) => return Ok(Arc::clone(occupied.get())),
            MapEntry::Vacant(vacant) => vacant,
        };

        let settings = self.settings_for(storage_id);
        let storage = self.create(storage_id, &settings)?;
        if storage_id.holds_references() {
            storage.set_notified_about_add_or_remove(true);
        }
        if !settings.embedded {
            if let Some(events) = &self.events {
                events.register_storage(&storage);
            }
        }
        info!(
            storage_id = %storage_id,
            kind = ?settings.kind,
            entries = storage.num_entries(),
            "storage opened"
        );
        vacant.insert(Arc::clone(&storage));
        Ok(storage)
    }

    fn create(&self, storage_id: &StorageId, settings: &QueueSettings) -> Result<Arc<dyn Storage>> {
        let property = settings.property();
        let storage: Arc<dyn Storage> = match settings.kind {
            StorageKind::Ram => Arc::new(RamQueue::new(storage_id.clone(), property)),
            StorageKind::Journal => Arc::new(JournalQueue::open(
                storage_id.clone(),
                property,
                &self.directory,
                Arc::clone(&self.factory),
                self.journal_options.clone(),
            )?),
            StorageKind::Cache => Arc::new(CacheQueue::open(
                storage_id.clone(),
                property,
                &self.directory,
                Arc::clone(&self.factory),
                self.journal_options.clone(),
            )?),
        };
        Ok(storage)
    }

    pub fn get(&self, storage_id: &StorageId) -> Option<Arc<dyn Storage>> {
        self.storages.get(storage_id).map(|s| Arc::clone(s.value()))
    }

    pub fn storage_ids(&self) -> Vec<StorageId> {
        let mut ids: Vec<StorageId> = self.storages.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.storages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storages.is_empty()
    }

    /// Deletes every entry of the storage and forgets it.
    pub fn cleanup(&self, storage_id: &StorageId) -> Result<i64> {
        let Some((_, storage)) = self.storages.remove(storage_id) else {
            return Ok(0);
        };
        if let Some(events) = &self.events {
            events.unregister_storage(storage.as_ref());
        }
        let removed = storage.clear()?;
        storage.shutdown();
        debug!(storage_id = %storage_id, removed, "storage cleaned up");
        Ok(removed)
    }

    /// Shuts every storage down; durable entries stay on disk.
    pub fn shutdown_all(&self) {
        let ids = self.storage_ids();
        for id in ids {
            if let Some((_, storage)) = self.storages.remove(&id) {
                storage.shutdown();
            } else {
                warn!(storage_id = %id, "storage vanished during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::core::events::LogDispatcher;

    fn config(dir: &std::path::Path) -> StoreConfig {
        let mut cfg = StoreConfig::from_toml_str(
            r#"
            [queues.default]
            kind = "ram"

            [queues.subject]
            kind = "journal"
            max_entries = 5

            [queues.topicStore]
            kind = "ram"
            embedded = true

            [events]
            thresholds = ["client/*/queue/subject/event/threshold.80%"]
            "#,
        )
        .unwrap();
        cfg.journal.directory = dir.to_path_buf();
        cfg
    }

    #[test]
    fn open_reuses_and_configures_storages() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let events = StorageEventHandler::new(Arc::new(LogDispatcher));
        events.register_events(cfg.thresholds.iter().map(String::as_str)).unwrap();
        events.register_finished();
        let registry = StorageRegistry::new(&cfg, Arc::new(EntryFactory::new()), Some(events.clone()));

        let subject = StorageId::parse("subject:/node/a/client/joe").unwrap();
        let a = registry.open(&subject).unwrap();
        let b = registry.open(&subject).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!a.is_transient());
        assert!(a.is_notified_about_add_or_remove());
        assert_eq!(events.threshold_of(&subject), Some(4));

        let topics = StorageId::parse("topicStore:/node/a").unwrap();
        let t = registry.open(&topics).unwrap();
        assert!(t.is_transient());
        assert!(!t.is_notified_about_add_or_remove());
        assert!(!events.is_watched(&topics));

        assert_eq!(registry.storage_ids(), vec![subject.clone(), topics]);
        assert_eq!(registry.cleanup(&subject).unwrap(), 0);
        assert!(registry.get(&subject).is_none());
        registry.shutdown_all();
        assert!(registry.is_empty());
    }

    #[test]
    fn racing_opens_share_one_configured_storage() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let registry = StorageRegistry::new(&cfg, Arc::new(EntryFactory::new()), None);
        let subject = StorageId::parse("subject:/node/a/client/ann").unwrap();
        let start = std::sync::Barrier::new(8);

        let opened: Vec<Arc<dyn Storage>> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        start.wait();
                        let storage = registry.open(&subject).unwrap();
                        assert!(storage.is_notified_about_add_or_remove());
                        storage
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });
        assert!(opened.iter().all(|s| Arc::ptr_eq(s, &opened[0])));
        assert_eq!(registry.len(), 1);
    }
}
