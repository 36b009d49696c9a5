//! The payload arena: one slot per `(key oid, unique id)`, holding the live
//! reference counters of a [`MeatEntry`].
//!
//! Persistent payloads are mirrored into a backing storage and may be swapped
//! out of memory; a dirty read transparently reloads them.

use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::core::entry::{Entry, MeatLookup, RefCountOutcome};
use crate::core::error::{Result, StoreError};
use crate::core::expiry::{ExpirySnapshot, ExpiryTimer};
use crate::core::meat::MeatEntry;
use crate::core::storage::Storage;
use crate::core::storage_id::StorageId;
use crate::core::timestamp;

type MeatKey = (String, i64);

#[derive(Debug)]
struct Slot {
    /// `None` while swapped out to the backing storage.
    meat: Option<Arc<MeatEntry>>,
    persistent: bool,
    size: i64,
    references: i32,
    history_references: i32,
    /// Short-lived holds taken while references are being queued.
    pins: u32,
    seq: u64,
}

impl Slot {
    fn unreferenced(&self) -> bool {
        self.references == 0 && self.history_references == 0 && self.pins == 0
    }
}

#[derive(Debug, Default)]
struct Slots {
    map: HashMap<MeatKey, Slot>,
    resident_bytes: i64,
    next_seq: u64,
}

#[derive(Debug, Default)]
pub struct MeatStoreStats {
    pub inserted: AtomicU64,
    pub discarded: AtomicU64,
    pub expired: AtomicU64,
    pub swapped_out: AtomicU64,
    pub swapped_in: AtomicU64,
    pub misses: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeatStoreStatsSnapshot {
    pub inserted: u64,
    pub discarded: u64,
    pub expired: u64,
    pub swapped_out: u64,
    pub swapped_in: u64,
    pub misses: u64,
    pub slots: usize,
    pub resident_bytes: i64,
    pub expiry: ExpirySnapshot,
}

#[derive(Debug)]
pub struct MeatStore {
    storage_id: StorageId,
    backing: Option<Arc<dyn Storage>>,
    slots: Mutex<Slots>,
    timer: ExpiryTimer<MeatKey>,
    stats: MeatStoreStats,
}

impl MeatStore {
    /// Without a backing storage every payload is transient and never swapped.
    pub fn new(storage_id: StorageId, backing: Option<Arc<dyn Storage>>) -> Arc<Self> {
        Arc::new(Self {
            storage_id,
            backing,
            slots: Mutex::new(Slots::default()),
            timer: ExpiryTimer::new(),
            stats: MeatStoreStats::default(),
        })
    }

    pub fn storage_id(&self) -> &StorageId {
        &self.storage_id
    }

    /// Adds a payload. `false` if a payload with the same key already exists.
    pub fn insert(&self, meat: Arc<MeatEntry>) -> Result<bool> {
        self.insert_with_pins(meat, 0)
    }

    /// Adds a payload, or finds the stored one with the same key, and holds
    /// it until the returned pin is dropped.
    pub fn insert_pinned(self: &Arc<Self>, meat: Arc<MeatEntry>) -> Result<PayloadPin> {
        let key = (meat.key_oid().to_string(), meat.unique_id());
        if !self.insert_with_pins(meat, 1)? {
            return self.pin(&key.0, key.1).ok_or_else(|| {
                StoreError::Internal(format!("payload {}/{} vanished while pinning", key.0, key.1))
            });
        }
        Ok(PayloadPin {
            store: Arc::clone(self),
            key,
        })
    }

    fn insert_with_pins(&self, meat: Arc<MeatEntry>, pins: u32) -> Result<bool> {
        let key = (meat.key_oid().to_string(), meat.unique_id());
        let persistent = meat.header().is_persistent();
        let expires_at = meat.expires_at();
        {
            let mut slots = self.slots.lock();
            let vacant = match slots.map.entry(key.clone()) {
                MapEntry::Occupied(_) => {
                    debug!(key_oid = %key.0, meat_id = key.1, "payload already stored");
                    return Ok(false);
                }
                MapEntry::Vacant(vacant) => vacant,
            };
            if persistent {
                if let Some(backing) = &self.backing {
                    backing.put(Entry::Meat(Arc::clone(&meat)), true)?;
                }
            }
            let size = meat.header().size_in_bytes();
            let slot = Slot {
                persistent,
                size,
                references: meat.reference_count(),
                history_references: meat.history_reference_count(),
                pins,
                meat: Some(meat),
                seq: 0,
            };
            vacant.insert(slot);
            Self::account_inserted(&mut slots, &key, size);
        }
        if let Some(at) = expires_at {
            self.timer.schedule(key, at);
        }
        self.stats.inserted.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn account_inserted(slots: &mut Slots, key: &MeatKey, size: i64) {
        let seq = slots.next_seq;
        slots.next_seq += 1;
        slots.resident_bytes += size;
        if let Some(slot) = slots.map.get_mut(key) {
            slot.seq = seq;
        }
    }

    /// Restores a payload read back from the backing storage.
    fn restore_slot(&self, key: MeatKey, meat: Arc<MeatEntry>) {
        let expires_at = meat.expires_at();
        {
            let mut slots = self.slots.lock();
            let MapEntry::Vacant(vacant) = slots.map.entry(key.clone()) else {
                warn!(key_oid = %key.0, meat_id = key.1, "payload recovered twice, keeping the first");
                return;
            };
            let size = meat.header().size_in_bytes();
            vacant.insert(Slot {
                persistent: true,
                size,
                references: meat.reference_count(),
                history_references: meat.history_reference_count(),
                pins: 0,
                meat: Some(meat),
                seq: 0,
            });
            Self::account_inserted(&mut slots, &key, size);
        }
        if let Some(at) = expires_at {
            self.timer.schedule(key, at);
        }
    }

    /// Holds a stored payload so it survives its counters reaching zero.
    /// `None` if the payload is gone.
    pub fn pin(self: &Arc<Self>, key_oid: &str, unique_id: i64) -> Option<PayloadPin> {
        let key = (key_oid.to_string(), unique_id);
        let mut slots = self.slots.lock();
        let slot = slots.map.get_mut(&key)?;
        slot.pins += 1;
        Some(PayloadPin {
            store: Arc::clone(self),
            key,
        })
    }

    fn unpin(&self, key: &MeatKey) {
        let detached = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.map.get_mut(key) else {
                return;
            };
            slot.pins = slot.pins.saturating_sub(1);
            if !slot.unreferenced() {
                return;
            }
            Self::detach(&mut slots, key)
        };
        if let Some(slot) = detached {
            self.release_detached(key, slot);
            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
            debug!(key_oid = %key.0, meat_id = key.1, "unreferenced payload discarded");
        }
    }

    /// Reloads every persisted payload, dropping transient leftovers first.
    pub fn recover(&self) -> Result<usize> {
        let Some(backing) = &self.backing else {
            return Ok(0);
        };
        let purged = backing.remove_transient()?;
        let mut recovered = 0;
        for entry in backing.entries(None)? {
            if let Entry::Meat(meat) = entry {
                let key = (meat.key_oid().to_string(), meat.unique_id());
                self.restore_slot(key, meat);
                recovered += 1;
            }
        }
        info!(storage_id = %self.storage_id, recovered, purged, "payload store recovered");
        Ok(recovered)
    }

    /// Live `(references, history references)` of a payload.
    pub fn reference_counts(&self, key_oid: &str, unique_id: i64) -> Option<(i32, i32)> {
        self.slots
            .lock()
            .map
            .get(&(key_oid.to_string(), unique_id))
            .map(|s| (s.references, s.history_references))
    }

    pub fn len(&self) -> usize {
        self.slots.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn resident_bytes(&self) -> i64 {
        self.slots.lock().resident_bytes
    }

    // ───────────────────────────────────────────────────────────
    // Swapping
    // ───────────────────────────────────────────────────────────

    /// Drops a persistent payload from memory; it stays in the backing store.
    pub fn swap_out(&self, key_oid: &str, unique_id: i64) -> bool {
        if self.backing.is_none() {
            return false;
        }
        let mut slots = self.slots.lock();
        let Some(slot) = slots.map.get_mut(&(key_oid.to_string(), unique_id)) else {
            return false;
        };
        if !slot.persistent {
            return false;
        }
        let Some(meat) = slot.meat.take() else {
            return false;
        };
        meat.mark_swapped();
        let size = slot.size;
        slots.resident_bytes -= size;
        self.stats.swapped_out.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Swaps out the oldest persistent payloads until at most
    /// `max_resident_bytes` stay in memory. Returns how many were swapped.
    pub fn relieve_pressure(&self, max_resident_bytes: i64) -> usize {
        let candidates: Vec<MeatKey> = {
            let slots = self.slots.lock();
            if slots.resident_bytes <= max_resident_bytes {
                return 0;
            }
            let mut resident: Vec<(&MeatKey, &Slot)> = slots
                .map
                .iter()
                .filter(|(_, s)| s.persistent && s.meat.is_some())
                .collect();
            resident.sort_by_key(|(_, s)| s.seq);
            resident.into_iter().map(|(k, _)| k.clone()).collect()
        };
        let mut swapped = 0;
        for (oid, uid) in candidates {
            if self.resident_bytes() <= max_resident_bytes {
                break;
            }
            if self.swap_out(&oid, uid) {
                swapped += 1;
            }
        }
        if swapped > 0 {
            debug!(storage_id = %self.storage_id, swapped, "swapped out payloads");
        }
        swapped
    }

    fn swap_in(&self, key: &MeatKey) -> Option<Arc<MeatEntry>> {
        let backing = self.backing.as_ref()?;
        let loaded = match backing.fetch(key.1) {
            Ok(Some(Entry::Meat(meat))) => meat,
            Ok(_) => return None,
            Err(e) => {
                warn!(key_oid = %key.0, meat_id = key.1, error = %e, "could not reload swapped payload");
                return None;
            }
        };
        let mut slots = self.slots.lock();
        let slot = slots.map.get_mut(key)?;
        if let Some(current) = &slot.meat {
            return Some(Arc::clone(current));
        }
        slot.meat = Some(Arc::clone(&loaded));
        let size = slot.size;
        slots.resident_bytes += size;
        self.stats.swapped_in.fetch_add(1, Ordering::Relaxed);
        Some(loaded)
    }

    // ───────────────────────────────────────────────────────────
    // Removal
    // ───────────────────────────────────────────────────────────

    fn detach(slots: &mut Slots, key: &MeatKey) -> Option<Slot> {
        let slot = slots.map.remove(key)?;
        if slot.meat.is_some() {
            slots.resident_bytes -= slot.size;
        }
        Some(slot)
    }

    fn evict(&self, key: &MeatKey) -> Option<Slot> {
        let slot = Self::detach(&mut self.slots.lock(), key)?;
        Some(self.release_detached(key, slot))
    }

    /// Cleanup of a slot already removed from the map.
    fn release_detached(&self, key: &MeatKey, slot: Slot) -> Slot {
        self.timer.cancel(key);
        if let Some(meat) = &slot.meat {
            meat.mark_swapped();
        }
        if slot.persistent {
            self.remove_from_backing(key, slot.meat.clone());
        }
        slot
    }

    fn remove_from_backing(&self, key: &MeatKey, resident: Option<Arc<MeatEntry>>) {
        let Some(backing) = &self.backing else {
            return;
        };
        let entry = match resident {
            Some(meat) => Entry::Meat(meat),
            None => match backing.fetch(key.1) {
                Ok(Some(entry)) => entry,
                Ok(None) => return,
                Err(e) => {
                    warn!(key_oid = %key.0, meat_id = key.1, error = %e, "could not load payload for removal");
                    return;
                }
            },
        };
        if let Err(e) = backing.remove_random(&entry) {
            warn!(key_oid = %key.0, meat_id = key.1, error = %e, "could not remove payload from backing store");
        }
    }

    /// Drops every payload whose lifetime elapsed by `now_ms`.
    pub fn sweep_expired(&self, now_ms: u64) -> usize {
        let due = self.timer.pop_expired(now_ms);
        let mut expired = 0;
        for key in due {
            if self.evict(&key).is_some() {
                debug!(key_oid = %key.0, meat_id = key.1, "payload expired");
                expired += 1;
            }
        }
        self.stats.expired.fetch_add(expired as u64, Ordering::Relaxed);
        expired
    }

    /// Runs [`sweep_expired`](Self::sweep_expired) every `every` until the
    /// store is dropped.
    pub fn spawn_expiry_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = interval(every);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let expired = store.sweep_expired(timestamp::now_millis());
                if expired > 0 {
                    debug!(storage_id = %store.storage_id, expired, "expiry sweep");
                }
            }
        })
    }

    pub fn stats(&self) -> MeatStoreStatsSnapshot {
        let (slots, resident_bytes) = {
            let s = self.slots.lock();
            (s.map.len(), s.resident_bytes)
        };
        MeatStoreStatsSnapshot {
            inserted: self.stats.inserted.load(Ordering::Relaxed),
            discarded: self.stats.discarded.load(Ordering::Relaxed),
            expired: self.stats.expired.load(Ordering::Relaxed),
            swapped_out: self.stats.swapped_out.load(Ordering::Relaxed),
            swapped_in: self.stats.swapped_in.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            slots,
            resident_bytes,
            expiry: self.timer.snapshot(),
        }
    }
}

/// Keeps a payload stored while references to it are being queued.
#[derive(Debug)]
pub struct PayloadPin {
    store: Arc<MeatStore>,
    key: MeatKey,
}

impl PayloadPin {
    pub fn key_oid(&self) -> &str {
        &self.key.0
    }

    pub fn unique_id(&self) -> i64 {
        self.key.1
    }
}

impl Drop for PayloadPin {
    fn drop(&mut self) {
        self.store.unpin(&self.key);
    }
}

impl MeatLookup for MeatStore {
    fn lookup_dirty_read(&self, key_oid: &str, unique_id: i64) -> Option<Arc<MeatEntry>> {
        let key = (key_oid.to_string(), unique_id);
        {
            let slots = self.slots.lock();
            match slots.map.get(&key) {
                None => {
                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Some(slot) => {
                    if let Some(meat) = &slot.meat {
                        return Some(Arc::clone(meat));
                    }
                }
            }
        }
        self.swap_in(&key)
    }

    fn increment_reference_counter(
        &self,
        key_oid: &str,
        unique_id: i64,
        incr: i32,
        storage_id: &StorageId,
    ) -> RefCountOutcome {
        let key = (key_oid.to_string(), unique_id);
        let mut slots = self.slots.lock();
        let Some(slot) = slots.map.get_mut(&key) else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return RefCountOutcome::Missing;
        };
        let counter = if storage_id.is_history() {
            &mut slot.history_references
        } else {
            &mut slot.references
        };
        *counter += incr;
        if *counter < 0 {
            warn!(
                key_oid,
                meat_id = unique_id,
                storage_id = %storage_id,
                count = *counter,
                "reference counter went negative, clamping"
            );
            *counter = 0;
        }
        let (references, history_references) = (slot.references, slot.history_references);

        if incr < 0 && slot.unreferenced() {
            let detached = Self::detach(&mut slots, &key);
            drop(slots);
            if let Some(slot) = detached {
                self.release_detached(&key, slot);
                self.stats.discarded.fetch_add(1, Ordering::Relaxed);
                debug!(key_oid, meat_id = unique_id, "last reference released, payload discarded");
            }
            return RefCountOutcome::Discarded;
        }

        // The snapshot is written under the slot lock so concurrent updates
        // reach the backing storage in counter order.
        if slot.persistent {
            if let Some(backing) = &self.backing {
                let current = match &slot.meat {
                    Some(meat) => Some(Arc::clone(meat)),
                    None => match backing.fetch(unique_id) {
                        Ok(Some(Entry::Meat(meat))) => Some(meat),
                        Ok(_) => None,
                        Err(e) => {
                            warn!(key_oid, meat_id = unique_id, error = %e, "could not load swapped payload");
                            None
                        }
                    },
                };
                if let Some(meat) = current {
                    let snapshot = Entry::Meat(Arc::new(meat.with_counters(references, history_references)));
                    if let Err(e) = backing.update(snapshot) {
                        warn!(key_oid, meat_id = unique_id, error = %e, "could not persist reference counters");
                    }
                }
            }
        }
        RefCountOutcome::Updated {
            references,
            history_references,
        }
    }

    fn start_expiry_timer(&self, meat: &Arc<MeatEntry>) {
        if let Some(at) = meat.expires_at() {
            self.timer
                .schedule((meat.key_oid().to_string(), meat.unique_id()), at);
        }
    }
}
