//! Wires the storage core together for one node.
//!
//! A [`StoreContext`] owns the entry factory, the payload store with its
//! journal backing, the threshold handler and the storage registry. Queues
//! obtained from it decode their references against the shared payload store.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::config::StoreConfig;
use crate::core::blocking::BlockingQueueWrapper;
use crate::core::entry::{Entry, HistoryEntry, MeatLookup, UpdateEntry, UpdateFlag};
use crate::core::error::{Result, StoreError};
use crate::core::events::{EventDispatcher, LogDispatcher, StorageEventHandler};
use crate::core::factory::EntryFactory;
use crate::core::meat::{MeatEntry, MeatStore, MsgUnit};
use crate::core::storage::{PutOutcome, Storage, StorageRegistry};
use crate::core::storage_id::{StorageId, MSG_UNIT_STORE};

#[derive(Debug)]
pub struct StoreContext {
    config: StoreConfig,
    factory: Arc<EntryFactory>,
    meat: Arc<MeatStore>,
    events: Arc<StorageEventHandler>,
    registry: StorageRegistry,
}

impl StoreContext {
    /// Opens the node's storages, logging threshold alarms.
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::open_with_dispatcher(config, Arc::new(LogDispatcher))
    }

    pub fn open_with_dispatcher(config: StoreConfig, dispatcher: Arc<dyn EventDispatcher>) -> Result<Self> {
        let factory = Arc::new(EntryFactory::new());

        let events = StorageEventHandler::new(dispatcher);
        events.register_events(config.thresholds.iter().map(String::as_str))?;

        let registry = StorageRegistry::new(&config, Arc::clone(&factory), Some(Arc::clone(&events)));

        let meat_id = StorageId::new(MSG_UNIT_STORE, &format!("/node/{}", config.node_id))?;
        let backing = registry.open(&meat_id)?;
        let meat = MeatStore::new(meat_id, Some(backing));
        let lookup: Arc<dyn MeatLookup> = meat.clone();
        factory.bind_lookup(&lookup)?;

        let recovered = meat.recover()?;
        if config.meat.max_resident_bytes >= 0 {
            meat.relieve_pressure(config.meat.max_resident_bytes);
        }
        events.register_finished();

        info!(
            node_id = %config.node_id,
            directory = %config.journal.directory.display(),
            recovered,
            rules = events.rule_count(),
            "store context opened"
        );
        Ok(Self {
            config,
            factory,
            meat,
            events,
            registry,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn factory(&self) -> &Arc<EntryFactory> {
        &self.factory
    }

    pub fn meat_store(&self) -> &Arc<MeatStore> {
        &self.meat
    }

    pub fn events(&self) -> &Arc<StorageEventHandler> {
        &self.events
    }

    pub fn registry(&self) -> &StorageRegistry {
        &self.registry
    }

    pub fn open_storage(&self, storage_id: &StorageId) -> Result<Arc<dyn Storage>> {
        self.registry.open(storage_id)
    }

    /// Blocking access to a storage using the configured poll interval.
    pub fn blocking(&self, storage_id: &StorageId) -> Result<BlockingQueueWrapper> {
        let storage = self.open_storage(storage_id)?;
        Ok(BlockingQueueWrapper::with_poll_interval(
            storage,
            self.config.blocking.poll_interval_ms,
        ))
    }

    // ───────────────────────────────────────────────────────────
    // Publishing
    // ───────────────────────────────────────────────────────────

    /// Stores the payload once and queues a reference to it in every
    /// destination. History destinations get a [`HistoryEntry`].
    ///
    /// The payload is pinned until every destination holds its reference, so
    /// a consumer releasing an early reference cannot discard it mid fan-out.
    /// With no destinations nothing keeps the payload and it is dropped again.
    pub fn publish(&self, msg_unit: MsgUnit, destinations: &[StorageId]) -> Result<Arc<MeatEntry>> {
        let meat = Arc::new(MeatEntry::new(msg_unit, Some(self.meat.storage_id().clone())));
        let _pin = self.meat.insert_pinned(Arc::clone(&meat))?;
        for storage_id in destinations {
            self.put_reference(storage_id, &meat, UpdateFlag::default())?;
        }
        Ok(meat)
    }

    /// Queues one more reference to an already stored payload.
    ///
    /// Fails with [`StoreError::PayloadGone`] once the payload was discarded.
    pub fn enqueue(&self, storage_id: &StorageId, meat: &Arc<MeatEntry>, flag: UpdateFlag) -> Result<PutOutcome> {
        let Some(_pin) = self.meat.pin(meat.key_oid(), meat.unique_id()) else {
            return Err(StoreError::PayloadGone {
                key_oid: meat.key_oid().to_string(),
                unique_id: meat.unique_id(),
            });
        };
        self.put_reference(storage_id, meat, flag)
    }

    fn put_reference(&self, storage_id: &StorageId, meat: &Arc<MeatEntry>, flag: UpdateFlag) -> Result<PutOutcome> {
        let storage = self.open_storage(storage_id)?;
        let lookup: Arc<dyn MeatLookup> = self.meat.clone();
        let entry: Entry = if storage_id.is_history() {
            HistoryEntry::new(meat, Some(lookup)).into()
        } else {
            UpdateEntry::new(meat, Some(lookup), Some(storage_id.postfix().to_string()), None, flag).into()
        };
        storage.put(entry, false)
    }

    // ───────────────────────────────────────────────────────────
    // Background work
    // ───────────────────────────────────────────────────────────

    /// Starts the payload expiry sweeper; `None` when disabled by config.
    /// Must be called inside a tokio runtime.
    pub fn spawn_background(&self) -> Option<JoinHandle<()>> {
        let every = self.config.meat.expiry_sweep_interval_ms;
        (every > 0).then(|| self.meat.spawn_expiry_sweeper(Duration::from_millis(every)))
    }

    /// Shuts every storage down. Durable entries stay on disk.
    pub fn shutdown(&self) {
        self.registry.shutdown_all();
        info!(node_id = %self.config.node_id, "store context shut down");
    }
}
