//! Entries that point at a payload owned by the [`MeatStore`](crate::core::meat::MeatStore).

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::core::entry::{EmbeddedType, EntryHeader};
use crate::core::meat::MeatEntry;
use crate::core::priority::Priority;
use crate::core::storage_id::StorageId;
use crate::core::timestamp;

/// Footprint estimate of a reference before its variable fields.
pub const REFERENCE_OVERHEAD_BYTES: i64 = 176;

/// Read access to the shared payload arena.
pub trait MeatLookup: Send + Sync + fmt::Debug {
    /// Lock-free lookup that may race with eviction; `None` is a normal answer.
    fn lookup_dirty_read(&self, key_oid: &str, unique_id: i64) -> Option<Arc<MeatEntry>>;

    fn increment_reference_counter(
        &self,
        key_oid: &str,
        unique_id: i64,
        incr: i32,
        storage_id: &StorageId,
    ) -> RefCountOutcome;

    /// (Re)arms the expiry timer of a payload rebuilt from storage.
    fn start_expiry_timer(&self, meat: &Arc<MeatEntry>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefCountOutcome {
    Updated { references: i32, history_references: i32 },
    /// The counters reached zero and the payload was dropped.
    Discarded,
    Missing,
}

/// Why a reference could not find its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissKind {
    ForceDestroy,
    HistorySweep,
    Expired,
    /// The reference already left its queue and holds no count.
    Released,
    Suspicious,
}

impl MissKind {
    pub fn is_benign(self) -> bool {
        !matches!(self, MissKind::Suspicious)
    }
}

/// Resolvable link from a reference entry to its payload.
///
/// The cached handle is only trusted while the payload is not swapped out;
/// otherwise the arena is asked again.
pub struct MeatLink {
    key_oid: String,
    meat_unique_id: i64,
    expires_at: Option<u64>,
    lookup: Option<Arc<dyn MeatLookup>>,
    cached: Mutex<Weak<MeatEntry>>,
    released: AtomicBool,
}

impl fmt::Debug for MeatLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeatLink")
            .field("key_oid", &self.key_oid)
            .field("meat_unique_id", &self.meat_unique_id)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl MeatLink {
    pub fn new(meat: &Arc<MeatEntry>, lookup: Option<Arc<dyn MeatLookup>>) -> Self {
        Self {
            key_oid: meat.key_oid().to_string(),
            meat_unique_id: meat.unique_id(),
            expires_at: meat.expires_at(),
            lookup,
            cached: Mutex::new(Arc::downgrade(meat)),
            released: AtomicBool::new(false),
        }
    }

    /// Link rebuilt from storage; the payload is looked up lazily.
    pub fn restore(key_oid: String, meat_unique_id: i64, lookup: Option<Arc<dyn MeatLookup>>) -> Self {
        let expires_at = lookup
            .as_ref()
            .and_then(|l| l.lookup_dirty_read(&key_oid, meat_unique_id))
            .and_then(|m| m.expires_at());
        Self {
            key_oid,
            meat_unique_id,
            expires_at,
            lookup,
            cached: Mutex::new(Weak::new()),
            released: AtomicBool::new(false),
        }
    }

    pub fn key_oid(&self) -> &str {
        &self.key_oid
    }

    pub fn meat_unique_id(&self) -> i64 {
        self.meat_unique_id
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|at| at <= timestamp::now_millis())
    }

    /// Dirty-read resolution of the payload. Never fails, `None` means gone.
    pub fn resolve(&self) -> Option<Arc<MeatEntry>> {
        let mut cached = self.cached.lock();
        if let Some(meat) = cached.upgrade() {
            if !meat.is_swapped() {
                return Some(meat);
            }
        }
        *cached = Weak::new();
        let meat = self
            .lookup
            .as_ref()?
            .lookup_dirty_read(&self.key_oid, self.meat_unique_id)?;
        *cached = Arc::downgrade(&meat);
        Some(meat)
    }

    pub fn classify_miss(&self, force_destroy: bool, history: bool) -> MissKind {
        if force_destroy {
            MissKind::ForceDestroy
        } else if history {
            MissKind::HistorySweep
        } else if self.is_expired() {
            MissKind::Expired
        } else if self.released.load(Ordering::Acquire) {
            MissKind::Released
        } else {
            MissKind::Suspicious
        }
    }

    fn report_miss(&self, kind: MissKind, incr: i32, storage_id: Option<&StorageId>) {
        let storage = storage_id.map(ToString::to_string).unwrap_or_default();
        if kind.is_benign() {
            debug!(
                key_oid = %self.key_oid,
                meat_id = self.meat_unique_id,
                incr,
                storage_id = %storage,
                ?kind,
                "no meat found"
            );
        } else {
            error!(
                key_oid = %self.key_oid,
                meat_id = self.meat_unique_id,
                incr,
                storage_id = %storage,
                "no meat found for live reference"
            );
        }
    }

    fn resolve_or_classify(&self, force_destroy: bool, history: bool) -> Result<Arc<MeatEntry>, MissKind> {
        match self.resolve() {
            Some(meat) => Ok(meat),
            None => {
                let kind = self.classify_miss(force_destroy, history);
                self.report_miss(kind, 0, None);
                Err(kind)
            }
        }
    }

    fn increment(&self, incr: i32, storage_id: &StorageId, force_destroy: bool) -> RefCountOutcome {
        self.released.store(incr < 0, Ordering::Release);
        let outcome = match &self.lookup {
            Some(lookup) => {
                lookup.increment_reference_counter(&self.key_oid, self.meat_unique_id, incr, storage_id)
            }
            None => RefCountOutcome::Missing,
        };
        if outcome == RefCountOutcome::Missing {
            let kind = self.classify_miss(force_destroy, storage_id.is_history());
            self.report_miss(kind, incr, Some(storage_id));
        }
        outcome
    }
}

/// Packed delivery state of an update entry: `state[|oneway][|forceDestroy]`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpdateFlag {
    pub state: String,
    pub oneway: bool,
    pub force_destroy: bool,
}

impl UpdateFlag {
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            ..Self::default()
        }
    }

    pub fn encode(&self) -> String {
        let mut out = self.state.clone();
        if self.oneway {
            out.push_str("|oneway");
        }
        if self.force_destroy {
            out.push_str("|forceDestroy");
        }
        out
    }

    /// Older rows carry only the state; unknown tokens are ignored.
    pub fn decode(raw: &str) -> Self {
        let mut parts = raw.split('|');
        let mut flag = Self::new(parts.next().unwrap_or_default());
        for token in parts {
            match token {
                "oneway" => flag.oneway = true,
                "forceDestroy" => flag.force_destroy = true,
                _ => {}
            }
        }
        flag
    }
}

/// Reference queued for one subscriber session (callback and subject queues).
#[derive(Debug)]
pub struct UpdateEntry {
    header: EntryHeader,
    link: MeatLink,
    receiver: Option<String>,
    subscription_id: Option<String>,
    flag: UpdateFlag,
    redeliver_counter: AtomicI32,
}

impl UpdateEntry {
    pub fn new(
        meat: &Arc<MeatEntry>,
        lookup: Option<Arc<dyn MeatLookup>>,
        receiver: Option<String>,
        subscription_id: Option<String>,
        flag: UpdateFlag,
    ) -> Self {
        let link = MeatLink::new(meat, lookup);
        let size = Self::estimate_size(&link, receiver.as_deref(), subscription_id.as_deref());
        let header = EntryHeader::new(
            meat.header().priority(),
            timestamp::next_unique_id(),
            meat.header().is_persistent(),
            size,
            EmbeddedType::UpdateRef,
        );
        Self {
            header,
            link,
            receiver,
            subscription_id,
            flag,
            redeliver_counter: AtomicI32::new(0),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        priority: Priority,
        unique_id: i64,
        persistent: bool,
        size_in_bytes: i64,
        link: MeatLink,
        receiver: Option<String>,
        subscription_id: Option<String>,
        flag: UpdateFlag,
        redeliver_counter: i32,
    ) -> Self {
        let estimate = Self::estimate_size(&link, receiver.as_deref(), subscription_id.as_deref());
        let header = EntryHeader::new(
            priority,
            unique_id,
            persistent,
            EntryHeader::settle_size(EmbeddedType::UpdateRef, estimate, Some(size_in_bytes)),
            EmbeddedType::UpdateRef,
        );
        Self {
            header,
            link,
            receiver,
            subscription_id,
            flag,
            redeliver_counter: AtomicI32::new(redeliver_counter),
        }
    }

    fn estimate_size(link: &MeatLink, receiver: Option<&str>, subscription_id: Option<&str>) -> i64 {
        REFERENCE_OVERHEAD_BYTES
            + link.key_oid().len() as i64
            + receiver.map_or(0, str::len) as i64
            + subscription_id.map_or(0, str::len) as i64
    }

    pub fn header(&self) -> &EntryHeader {
        &self.header
    }

    pub fn link(&self) -> &MeatLink {
        &self.link
    }

    pub fn receiver(&self) -> Option<&str> {
        self.receiver.as_deref()
    }

    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription_id.as_deref()
    }

    pub fn flag(&self) -> &UpdateFlag {
        &self.flag
    }

    pub fn redeliver_counter(&self) -> i32 {
        self.redeliver_counter.load(Ordering::Relaxed)
    }

    pub fn increment_redeliver_counter(&self) -> i32 {
        self.redeliver_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn resolve(&self) -> Option<Arc<MeatEntry>> {
        self.link.resolve_or_classify(self.flag.force_destroy, false).ok()
    }

    /// Payload or the reason it is unavailable.
    pub fn resolve_classified(&self) -> Result<Arc<MeatEntry>, MissKind> {
        self.link.resolve_or_classify(self.flag.force_destroy, false)
    }

    pub fn added(&self, storage_id: &StorageId) {
        self.link.increment(1, storage_id, self.flag.force_destroy);
    }

    pub fn removed(&self, storage_id: &StorageId) {
        self.link.increment(-1, storage_id, self.flag.force_destroy);
    }
}

/// Reference kept in a topic's history queue, newest first.
///
/// The unique id is the negated creation timestamp, so ascending id order
/// yields the most recent message first.
#[derive(Debug)]
pub struct HistoryEntry {
    header: EntryHeader,
    link: MeatLink,
}

impl HistoryEntry {
    pub fn new(meat: &Arc<MeatEntry>, lookup: Option<Arc<dyn MeatLookup>>) -> Self {
        let link = MeatLink::new(meat, lookup);
        let header = EntryHeader::new(
            Priority::NORM,
            -timestamp::next_unique_id(),
            meat.header().is_persistent(),
            Self::estimate_size(&link),
            EmbeddedType::HistoryRef,
        );
        Self { header, link }
    }

    /// `unique_id` is the stored, already negated value.
    pub fn restore(unique_id: i64, persistent: bool, size_in_bytes: i64, link: MeatLink) -> Self {
        let estimate = Self::estimate_size(&link);
        let header = EntryHeader::new(
            Priority::NORM,
            unique_id,
            persistent,
            EntryHeader::settle_size(EmbeddedType::HistoryRef, estimate, Some(size_in_bytes)),
            EmbeddedType::HistoryRef,
        );
        Self { header, link }
    }

    fn estimate_size(link: &MeatLink) -> i64 {
        REFERENCE_OVERHEAD_BYTES + link.key_oid().len() as i64
    }

    pub fn header(&self) -> &EntryHeader {
        &self.header
    }

    pub fn link(&self) -> &MeatLink {
        &self.link
    }

    /// Creation time in nanoseconds.
    pub fn timestamp(&self) -> i64 {
        -self.header.unique_id()
    }

    pub fn resolve(&self) -> Option<Arc<MeatEntry>> {
        self.link.resolve_or_classify(false, true).ok()
    }

    pub fn added(&self, storage_id: &StorageId) {
        self.link.increment(1, storage_id, false);
    }

    pub fn removed(&self, storage_id: &StorageId) {
        self.link.increment(-1, storage_id, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::meat::{MsgKey, MsgQos, MsgUnit};

    fn meat() -> Arc<MeatEntry> {
        Arc::new(MeatEntry::new(
            MsgUnit::new(MsgKey::new("hello"), MsgQos::new(Priority::HIGH, false), "hi"),
            None,
        ))
    }

    #[test]
    fn flag_round_trips_and_accepts_legacy_state() {
        let flag = UpdateFlag {
            state: "OK".into(),
            oneway: true,
            force_destroy: true,
        };
        assert_eq!(UpdateFlag::decode(&flag.encode()), flag);
        assert_eq!(UpdateFlag::decode("OK"), UpdateFlag::new("OK"));
    }

    #[test]
    fn history_entries_sort_newest_first() {
        let m = meat();
        let older = HistoryEntry::new(&m, None);
        let newer = HistoryEntry::new(&m, None);
        assert!(newer.header().order_key() < older.header().order_key());
        assert!(newer.timestamp() > older.timestamp());
    }

    #[test]
    fn update_entry_inherits_payload_priority() {
        let m = meat();
        let entry = UpdateEntry::new(&m, None, Some("client/joe/1".into()), None, UpdateFlag::new("OK"));
        assert_eq!(entry.header().priority(), Priority::HIGH);
        assert!(Arc::ptr_eq(&entry.resolve().unwrap(), &m));
    }

    #[test]
    fn cached_handle_is_dropped_when_swapped() {
        let m = meat();
        let entry = UpdateEntry::new(&m, None, None, None, UpdateFlag::new("OK"));
        m.mark_swapped();
        assert_eq!(entry.resolve_classified().unwrap_err(), MissKind::Suspicious);
    }

    #[test]
    fn force_destroy_miss_is_benign() {
        let m = meat();
        let mut flag = UpdateFlag::new("OK");
        flag.force_destroy = true;
        let entry = UpdateEntry::new(&m, None, None, None, flag);
        drop(m);
        let kind = entry.resolve_classified().unwrap_err();
        assert_eq!(kind, MissKind::ForceDestroy);
        assert!(kind.is_benign());
    }
}
