//! The unit stored in a queue or in the payload store.
//!
//! All variants share an [`EntryHeader`] with the ordering, size and
//! persistence fields; [`Entry`] is the closed union the storages hold.

pub mod records;
pub mod reference;

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::core::error::{Result, StoreError};
use crate::core::meat::MeatEntry;
use crate::core::priority::Priority;
use crate::core::storage_id::StorageId;

pub use records::{DummyEntry, SessionEntry, SubscribeEntry, TopicEntry};
pub use reference::{
    HistoryEntry, MeatLink, MeatLookup, MissKind, RefCountOutcome, UpdateEntry, UpdateFlag,
};

/// Serialization variant tag stored next to every persisted entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmbeddedType {
    UpdateRef,
    HistoryRef,
    MsgXml,
    MsgSerial,
    TopicXml,
    TopicSerial,
    Session,
    Subscribe,
    Dummy,
}

impl EmbeddedType {
    pub const ALL: [EmbeddedType; 9] = [
        EmbeddedType::UpdateRef,
        EmbeddedType::HistoryRef,
        EmbeddedType::MsgXml,
        EmbeddedType::MsgSerial,
        EmbeddedType::TopicXml,
        EmbeddedType::TopicSerial,
        EmbeddedType::Session,
        EmbeddedType::Subscribe,
        EmbeddedType::Dummy,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EmbeddedType::UpdateRef => "UPDATE_REF",
            EmbeddedType::HistoryRef => "HISTORY_REF",
            EmbeddedType::MsgXml => "MSG_XML",
            EmbeddedType::MsgSerial => "MSG_SER",
            EmbeddedType::TopicXml => "TOPIC_XML",
            EmbeddedType::TopicSerial => "TOPIC_SER",
            EmbeddedType::Session => "SESSION",
            EmbeddedType::Subscribe => "SUBSCRIBE",
            EmbeddedType::Dummy => "DUMMY",
        }
    }

    /// Case-insensitive; an unknown tag is a `NotImplemented` error.
    pub fn parse(tag: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(tag))
            .ok_or_else(|| StoreError::NotImplemented(tag.to_string()))
    }
}

impl fmt::Display for EmbeddedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields shared by every entry variant. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    priority: Priority,
    unique_id: i64,
    persistent: bool,
    size_in_bytes: i64,
    embedded_type: EmbeddedType,
}

impl EntryHeader {
    pub fn new(
        priority: Priority,
        unique_id: i64,
        persistent: bool,
        size_in_bytes: i64,
        embedded_type: EmbeddedType,
    ) -> Self {
        Self {
            priority,
            unique_id,
            persistent,
            size_in_bytes,
            embedded_type,
        }
    }

    /// Picks the size for a new or rehydrated entry. A stored size always wins;
    /// disagreement with the fresh estimate is only worth a warning.
    pub(crate) fn settle_size(embedded_type: EmbeddedType, estimate: i64, stored: Option<i64>) -> i64 {
        match stored {
            Some(stored) if stored >= 0 => {
                if stored != estimate {
                    warn!(
                        entry_type = %embedded_type,
                        stored,
                        estimate,
                        "stored entry size differs from recomputed estimate"
                    );
                }
                stored
            }
            _ => estimate,
        }
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn unique_id(&self) -> i64 {
        self.unique_id
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn size_in_bytes(&self) -> i64 {
        self.size_in_bytes
    }

    pub fn embedded_type(&self) -> EmbeddedType {
        self.embedded_type
    }

    pub fn order_key(&self) -> OrderKey {
        OrderKey::new(self.priority, self.unique_id)
    }
}

/// Sort key of an entry inside a storage: priority descending, then unique id
/// ascending. `a < b` means `a` is delivered first; a larger key is of lower order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OrderKey {
    pub priority: Priority,
    pub unique_id: i64,
}

impl OrderKey {
    pub fn new(priority: Priority, unique_id: i64) -> Self {
        Self { priority, unique_id }
    }

    /// `true` when `self` is of lower order than `other`.
    pub fn is_lower_than(&self, other: &OrderKey) -> bool {
        self > other
    }
}

impl Ord for OrderKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(self.unique_id.cmp(&other.unique_id))
    }
}

impl PartialOrd for OrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Anything that can live in a storage. Clones are cheap handle copies.
#[derive(Debug, Clone)]
pub enum Entry {
    Update(Arc<UpdateEntry>),
    History(Arc<HistoryEntry>),
    Meat(Arc<MeatEntry>),
    Topic(Arc<TopicEntry>),
    Session(Arc<SessionEntry>),
    Subscribe(Arc<SubscribeEntry>),
    Dummy(Arc<DummyEntry>),
}

impl Entry {
    pub fn header(&self) -> &EntryHeader {
        match self {
            Entry::Update(e) => e.header(),
            Entry::History(e) => e.header(),
            Entry::Meat(e) => e.header(),
            Entry::Topic(e) => e.header(),
            Entry::Session(e) => e.header(),
            Entry::Subscribe(e) => e.header(),
            Entry::Dummy(e) => e.header(),
        }
    }

    pub fn priority(&self) -> Priority {
        self.header().priority()
    }

    pub fn unique_id(&self) -> i64 {
        self.header().unique_id()
    }

    pub fn is_persistent(&self) -> bool {
        self.header().is_persistent()
    }

    pub fn size_in_bytes(&self) -> i64 {
        self.header().size_in_bytes()
    }

    pub fn embedded_type(&self) -> EmbeddedType {
        self.header().embedded_type()
    }

    pub fn order_key(&self) -> OrderKey {
        self.header().order_key()
    }

    /// `true` when this entry only points at a payload owned elsewhere.
    pub fn is_reference(&self) -> bool {
        matches!(self, Entry::Update(_) | Entry::History(_))
    }

    /// Resolves the payload this entry carries or points at.
    pub fn meat(&self) -> Option<Arc<MeatEntry>> {
        match self {
            Entry::Update(e) => e.resolve(),
            Entry::History(e) => e.resolve(),
            Entry::Meat(m) => Some(Arc::clone(m)),
            _ => None,
        }
    }

    /// Lifecycle hook fired after the entry entered `storage_id`.
    pub fn added(&self, storage_id: &StorageId) {
        match self {
            Entry::Update(e) => e.added(storage_id),
            Entry::History(e) => e.added(storage_id),
            _ => {}
        }
    }

    /// Lifecycle hook fired after the entry left `storage_id`.
    pub fn removed(&self, storage_id: &StorageId) {
        match self {
            Entry::Update(e) => e.removed(storage_id),
            Entry::History(e) => e.removed(storage_id),
            _ => {}
        }
    }
}

impl From<UpdateEntry> for Entry {
    fn from(e: UpdateEntry) -> Self {
        Entry::Update(Arc::new(e))
    }
}

impl From<HistoryEntry> for Entry {
    fn from(e: HistoryEntry) -> Self {
        Entry::History(Arc::new(e))
    }
}

impl From<MeatEntry> for Entry {
    fn from(e: MeatEntry) -> Self {
        Entry::Meat(Arc::new(e))
    }
}

impl From<TopicEntry> for Entry {
    fn from(e: TopicEntry) -> Self {
        Entry::Topic(Arc::new(e))
    }
}

impl From<SessionEntry> for Entry {
    fn from(e: SessionEntry) -> Self {
        Entry::Session(Arc::new(e))
    }
}

impl From<SubscribeEntry> for Entry {
    fn from(e: SubscribeEntry) -> Self {
        Entry::Subscribe(Arc::new(e))
    }
}

impl From<DummyEntry> for Entry {
    fn from(e: DummyEntry) -> Self {
        Entry::Dummy(Arc::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_type_is_case_insensitive() {
        assert_eq!(EmbeddedType::parse("update_ref").unwrap(), EmbeddedType::UpdateRef);
        assert_eq!(EmbeddedType::parse("MSG_SER").unwrap(), EmbeddedType::MsgSerial);
        assert!(matches!(
            EmbeddedType::parse("MSG_JSON"),
            Err(StoreError::NotImplemented(_))
        ));
    }

    #[test]
    fn higher_priority_sorts_first() {
        let high = OrderKey::new(Priority::MAX, 10);
        let low = OrderKey::new(Priority::MIN, 1);
        assert!(high < low);
        assert!(low.is_lower_than(&high));
    }

    #[test]
    fn older_sorts_first_within_priority() {
        let old = OrderKey::new(Priority::NORM, 1);
        let young = OrderKey::new(Priority::NORM, 2);
        assert!(old < young);
        assert!(young.is_lower_than(&old));
    }
}
