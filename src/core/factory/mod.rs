//! Single dispatch point between [`Entry`] values and their persisted forms.

pub mod columns;
pub mod csv;
pub mod record;

use std::sync::{Arc, Weak};

use bytes::Bytes;
use once_cell::sync::OnceCell;
use tracing::debug;

use crate::core::entry::{
    DummyEntry, EmbeddedType, Entry, HistoryEntry, MeatLink, MeatLookup, SessionEntry,
    SubscribeEntry, TopicEntry, UpdateEntry, UpdateFlag,
};
use crate::core::error::{Result, StoreError};
use crate::core::meat::{MeatEntry, MsgKey, MsgQos, MsgUnit};
use crate::core::priority::Priority;
use crate::core::storage_id::StorageId;

pub use columns::{ColumnPair, MeatColumns, RefColumns, StoreDescriptor};
use columns::meta;
use csv::{csv_to_map, map_to_csv, MetaInfo};
use record::{Field, FieldReader};

/// Minimum positional field count accepted per type.
fn min_fields(entry_type: EmbeddedType) -> usize {
    match entry_type {
        EmbeddedType::UpdateRef => 6,
        EmbeddedType::HistoryRef => 2,
        EmbeddedType::MsgXml => 3,
        EmbeddedType::MsgSerial => 1,
        EmbeddedType::TopicXml => 2,
        EmbeddedType::TopicSerial => 1,
        EmbeddedType::Session => 1,
        EmbeddedType::Subscribe => 3,
        EmbeddedType::Dummy => 0,
    }
}

/// A persisted row as handed back by a backing store.
#[derive(Debug, Clone, Copy)]
pub struct BlobRow<'a> {
    pub priority: i32,
    pub unique_id: i64,
    pub embedded_type: &'a str,
    pub persistent: bool,
    pub size_in_bytes: i64,
    pub blob: &'a [u8],
}

/// Encodes entries for storage and rebuilds them, wiring reference entries
/// to the payload arena bound with [`EntryFactory::bind_lookup`].
#[derive(Debug, Default)]
pub struct EntryFactory {
    lookup: OnceCell<Weak<dyn MeatLookup>>,
}

impl EntryFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the payload arena. Only the first binding takes effect.
    pub fn bind_lookup(&self, lookup: &Arc<dyn MeatLookup>) -> Result<()> {
        self.lookup
            .set(Arc::downgrade(lookup))
            .map_err(|_| StoreError::Internal("entry factory lookup bound twice".into()))
    }

    fn lookup(&self) -> Option<Arc<dyn MeatLookup>> {
        self.lookup.get().and_then(Weak::upgrade)
    }

    // ───────────────────────────────────────────────────────────
    // Blob form
    // ───────────────────────────────────────────────────────────

    pub fn serialize(&self, entry: &Entry) -> Result<Vec<u8>> {
        let fields = match entry {
            Entry::Update(e) => vec![
                Field::Str(e.link().key_oid().to_string()),
                Field::Long(e.link().meat_unique_id()),
                Field::opt_str(e.receiver()),
                Field::opt_str(e.subscription_id()),
                Field::Str(e.flag().encode()),
                Field::Int(e.redeliver_counter()),
            ],
            Entry::History(e) => vec![
                Field::Str(e.link().key_oid().to_string()),
                Field::Long(e.link().meat_unique_id()),
            ],
            Entry::Meat(m) => {
                let unit = m.msg_unit();
                let counters = [
                    Field::Int(m.reference_count()),
                    Field::Int(m.history_reference_count()),
                ];
                let mut fields = match m.header().embedded_type() {
                    EmbeddedType::MsgSerial => vec![Field::Bytes(bincode::serialize(unit)?)],
                    _ => vec![
                        Field::Str(unit.qos.to_literal()),
                        Field::Str(unit.key.to_literal()),
                        Field::Bytes(unit.content.to_vec()),
                    ],
                };
                fields.extend(counters);
                fields
            }
            Entry::Topic(t) => {
                let unit = t.msg_unit();
                match t.header().embedded_type() {
                    EmbeddedType::TopicSerial => vec![Field::Bytes(bincode::serialize(unit)?)],
                    _ => vec![
                        Field::Str(unit.qos.to_literal()),
                        Field::Str(unit.key.to_literal()),
                        Field::Bytes(unit.content.to_vec()),
                    ],
                }
            }
            Entry::Session(s) => vec![Field::Str(s.literal().to_string())],
            Entry::Subscribe(s) => vec![
                Field::Str(s.key_literal().to_string()),
                Field::Str(s.qos_literal().to_string()),
                Field::Str(s.session_name().to_string()),
            ],
            Entry::Dummy(d) => vec![Field::Bytes(d.content().to_vec())],
        };
        record::encode(&fields)
    }

    /// Rebuilds the entry of the kind named by `row.embedded_type`.
    ///
    /// Every failure comes back wrapped in [`StoreError::Decode`] carrying the
    /// row coordinates; use [`StoreError::root_cause`] to classify it.
    pub fn deserialize(&self, row: &BlobRow<'_>, storage_id: Option<&StorageId>) -> Result<Entry> {
        let priority = Priority::new(row.priority).unwrap_or(Priority::NORM);
        self.deserialize_inner(row, storage_id).map_err(|e| {
            StoreError::decode(storage_id, row.embedded_type, priority, row.unique_id, e)
        })
    }

    fn deserialize_inner(&self, row: &BlobRow<'_>, storage_id: Option<&StorageId>) -> Result<Entry> {
        let entry_type = EmbeddedType::parse(row.embedded_type)?;
        let priority = Priority::new(row.priority)?;
        let reader = FieldReader::decode(row.blob, entry_type, priority, row.unique_id)?;
        reader.require(min_fields(entry_type))?;

        let entry = match entry_type {
            EmbeddedType::UpdateRef => {
                if reader.len() > 6 {
                    debug!(fields = reader.len(), "ignoring legacy trailing update fields");
                }
                let link = MeatLink::restore(reader.str(0)?, reader.long(1)?, self.lookup());
                UpdateEntry::restore(
                    priority,
                    row.unique_id,
                    row.persistent,
                    row.size_in_bytes,
                    link,
                    reader.opt_str(2)?,
                    reader.opt_str(3)?,
                    UpdateFlag::decode(&reader.str(4)?),
                    reader.int_or(5, 0)?,
                )
                .into()
            }
            EmbeddedType::HistoryRef => {
                let link = MeatLink::restore(reader.str(0)?, reader.long(1)?, self.lookup());
                HistoryEntry::restore(row.unique_id, row.persistent, row.size_in_bytes, link).into()
            }
            EmbeddedType::MsgXml => {
                let unit = MsgUnit::new(
                    MsgKey::parse(&reader.str(1)?)?,
                    MsgQos::parse(&reader.str(0)?)?,
                    reader.bytes_or_empty(2)?,
                );
                self.restore_meat(unit, storage_id, entry_type, &reader, 3, row.size_in_bytes)?
            }
            EmbeddedType::MsgSerial => {
                let unit: MsgUnit = bincode::deserialize(&reader.bytes_or_empty(0)?)?;
                self.restore_meat(unit, storage_id, entry_type, &reader, 1, row.size_in_bytes)?
            }
            EmbeddedType::TopicXml => {
                let unit = MsgUnit::new(
                    MsgKey::parse(&reader.str(1)?)?,
                    MsgQos::parse(&reader.str(0)?)?,
                    reader.bytes_or_empty(2)?,
                );
                TopicEntry::restore(unit, entry_type, row.size_in_bytes).into()
            }
            EmbeddedType::TopicSerial => {
                let unit: MsgUnit = bincode::deserialize(&reader.bytes_or_empty(0)?)?;
                TopicEntry::restore(unit, entry_type, row.size_in_bytes).into()
            }
            EmbeddedType::Session => {
                SessionEntry::restore(row.unique_id, row.size_in_bytes, reader.str(0)?).into()
            }
            EmbeddedType::Subscribe => SubscribeEntry::restore(
                row.unique_id,
                row.size_in_bytes,
                reader.str(0)?,
                reader.str(1)?,
                reader.str(2)?,
            )
            .into(),
            EmbeddedType::Dummy => DummyEntry::restore(
                priority,
                row.unique_id,
                row.persistent,
                row.size_in_bytes,
                Bytes::from(reader.bytes_or_empty(0)?),
            )
            .into(),
        };
        Ok(entry)
    }

    fn restore_meat(
        &self,
        unit: MsgUnit,
        storage_id: Option<&StorageId>,
        entry_type: EmbeddedType,
        reader: &FieldReader,
        counters_at: usize,
        size_in_bytes: i64,
    ) -> Result<Entry> {
        let meat = Arc::new(MeatEntry::restore(
            unit,
            storage_id.cloned(),
            entry_type,
            reader.int_or(counters_at, 0)?,
            reader.int_or(counters_at + 1, 0)?,
            size_in_bytes,
        ));
        if let Some(lookup) = self.lookup() {
            lookup.start_expiry_timer(&meat);
        }
        Ok(Entry::Meat(meat))
    }

    // ───────────────────────────────────────────────────────────
    // Column form
    // ───────────────────────────────────────────────────────────

    pub fn serialize_to_columns(&self, entry: &Entry) -> Result<ColumnPair> {
        let header = entry.header();
        let mut reference = RefColumns {
            byte_size: header.size_in_bytes(),
            durable: header.is_persistent(),
            id: header.unique_id(),
            meat_id: None,
            meta_info: None,
            prio: header.priority().as_i32(),
        };
        let payload = |unit: &MsgUnit| MeatColumns {
            byte_size: header.size_in_bytes(),
            content: Some(unit.content.to_vec()),
            durable: header.is_persistent(),
            id: header.unique_id(),
            key: Some(unit.key.to_literal()),
            qos: Some(unit.qos.to_literal()),
            ..MeatColumns::default()
        };

        let meat = match entry {
            Entry::Update(e) => {
                let mut info = MetaInfo::new();
                info.insert(meta::KEY_OID.into(), e.link().key_oid().to_string());
                if let Some(receiver) = e.receiver() {
                    info.insert(meta::RECEIVER.into(), receiver.to_string());
                }
                if let Some(sub) = e.subscription_id() {
                    info.insert(meta::SUBSCRIPTION_ID.into(), sub.to_string());
                }
                info.insert(meta::FLAG.into(), e.flag().encode());
                info.insert(meta::REDELIVER.into(), e.redeliver_counter().to_string());
                reference.meat_id = Some(e.link().meat_unique_id());
                reference.meta_info = Some(map_to_csv(&info));
                None
            }
            Entry::History(e) => {
                let mut info = MetaInfo::new();
                info.insert(meta::KEY_OID.into(), e.link().key_oid().to_string());
                reference.meat_id = Some(e.link().meat_unique_id());
                reference.meta_info = Some(map_to_csv(&info));
                None
            }
            Entry::Meat(m) => {
                reference.meat_id = Some(m.unique_id());
                Some(MeatColumns {
                    ref_count: m.reference_count() as i64,
                    data_type: Some(m.history_reference_count().to_string()),
                    ..payload(m.msg_unit())
                })
            }
            Entry::Topic(t) => {
                reference.meat_id = Some(header.unique_id());
                Some(payload(t.msg_unit()))
            }
            Entry::Session(s) => {
                reference.meat_id = Some(header.unique_id());
                Some(MeatColumns {
                    byte_size: header.size_in_bytes(),
                    durable: true,
                    id: header.unique_id(),
                    qos: Some(s.literal().to_string()),
                    ..MeatColumns::default()
                })
            }
            Entry::Subscribe(s) => {
                let mut info = MetaInfo::new();
                info.insert(meta::SESSION_NAME.into(), s.session_name().to_string());
                reference.meat_id = Some(header.unique_id());
                Some(MeatColumns {
                    byte_size: header.size_in_bytes(),
                    durable: true,
                    id: header.unique_id(),
                    key: Some(s.key_literal().to_string()),
                    qos: Some(s.qos_literal().to_string()),
                    meta_info: Some(map_to_csv(&info)),
                    ..MeatColumns::default()
                })
            }
            Entry::Dummy(d) => {
                reference.meat_id = Some(header.unique_id());
                Some(MeatColumns {
                    byte_size: header.size_in_bytes(),
                    durable: header.is_persistent(),
                    id: header.unique_id(),
                    content: Some(d.content().to_vec()),
                    ..MeatColumns::default()
                })
            }
        };
        Ok(ColumnPair { meat, reference })
    }

    /// Inverse of [`serialize_to_columns`](Self::serialize_to_columns),
    /// dispatching on the store's declared type.
    pub fn decode_from_columns(
        &self,
        store: &StoreDescriptor,
        meat: Option<&MeatColumns>,
        reference: Option<&RefColumns>,
    ) -> Result<Entry> {
        let (priority, unique_id) = match (reference, meat) {
            (Some(r), _) => (Priority::new(r.prio).unwrap_or(Priority::NORM), r.id),
            (None, Some(m)) => (Priority::NORM, m.id),
            (None, None) => (Priority::NORM, 0),
        };
        self.decode_columns_inner(store, meat, reference).map_err(|e| {
            StoreError::decode(
                Some(&store.storage_id),
                store.entry_type.as_str(),
                priority,
                unique_id,
                e,
            )
        })
    }

    fn decode_columns_inner(
        &self,
        store: &StoreDescriptor,
        meat: Option<&MeatColumns>,
        reference: Option<&RefColumns>,
    ) -> Result<Entry> {
        let need_ref = || {
            reference.ok_or_else(|| {
                StoreError::IllegalArgument(format!("{} needs a ref row", store.entry_type))
            })
        };
        let need_meat = || {
            meat.ok_or_else(|| {
                StoreError::IllegalArgument(format!("{} needs a meat row", store.entry_type))
            })
        };
        let literal = |value: &Option<String>, what: &str| {
            value
                .clone()
                .ok_or_else(|| StoreError::IllegalArgument(format!("meat row without {what}")))
        };
        let msg_unit = |m: &MeatColumns| -> Result<MsgUnit> {
            Ok(MsgUnit::new(
                MsgKey::parse(&literal(&m.key, "key")?)?,
                MsgQos::parse(&literal(&m.qos, "qos")?)?,
                m.content.clone().unwrap_or_default(),
            ))
        };

        let entry = match store.entry_type {
            EmbeddedType::UpdateRef | EmbeddedType::HistoryRef => {
                let r = need_ref()?;
                let info = csv_to_map(r.meta_info.as_deref().unwrap_or_default());
                let key_oid = info.get(meta::KEY_OID).cloned().ok_or_else(|| {
                    StoreError::IllegalArgument("ref row without keyOid".into())
                })?;
                let meat_id = r
                    .meat_id
                    .ok_or_else(|| StoreError::IllegalArgument("ref row without meatId".into()))?;
                let link = MeatLink::restore(key_oid, meat_id, self.lookup());
                if store.entry_type == EmbeddedType::HistoryRef {
                    HistoryEntry::restore(r.id, r.durable, r.byte_size, link).into()
                } else {
                    let redeliver = info
                        .get(meta::REDELIVER)
                        .map(|v| v.parse::<i32>())
                        .transpose()
                        .map_err(|e| StoreError::IllegalArgument(format!("redeliverCounter: {e}")))?
                        .unwrap_or(0);
                    UpdateEntry::restore(
                        Priority::new(r.prio)?,
                        r.id,
                        r.durable,
                        r.byte_size,
                        link,
                        info.get(meta::RECEIVER).cloned(),
                        info.get(meta::SUBSCRIPTION_ID).cloned(),
                        UpdateFlag::decode(info.get(meta::FLAG).map_or("", String::as_str)),
                        redeliver,
                    )
                    .into()
                }
            }
            EmbeddedType::MsgXml | EmbeddedType::MsgSerial => {
                let m = need_meat()?;
                let history = m
                    .data_type
                    .as_deref()
                    .map(str::parse::<i32>)
                    .transpose()
                    .map_err(|e| StoreError::IllegalArgument(format!("history ref count: {e}")))?
                    .unwrap_or(0);
                let meat = Arc::new(MeatEntry::restore(
                    msg_unit(m)?,
                    Some(store.storage_id.clone()),
                    store.entry_type,
                    i32::try_from(m.ref_count).unwrap_or(i32::MAX),
                    history,
                    m.byte_size,
                ));
                if let Some(lookup) = self.lookup() {
                    lookup.start_expiry_timer(&meat);
                }
                Entry::Meat(meat)
            }
            EmbeddedType::TopicXml | EmbeddedType::TopicSerial => {
                let m = need_meat()?;
                TopicEntry::restore(msg_unit(m)?, store.entry_type, m.byte_size).into()
            }
            EmbeddedType::Session => {
                let m = need_meat()?;
                SessionEntry::restore(m.id, m.byte_size, literal(&m.qos, "qos")?).into()
            }
            EmbeddedType::Subscribe => {
                let m = need_meat()?;
                let info = csv_to_map(m.meta_info.as_deref().unwrap_or_default());
                let session_name = info
                    .get(meta::SESSION_NAME)
                    .cloned()
                    .or_else(|| m.data_type.clone())
                    .ok_or_else(|| StoreError::IllegalArgument("subscribe row without sessionName".into()))?;
                SubscribeEntry::restore(
                    m.id,
                    m.byte_size,
                    literal(&m.key, "key")?,
                    literal(&m.qos, "qos")?,
                    session_name,
                )
                .into()
            }
            EmbeddedType::Dummy => {
                let r = reference;
                let m = meat;
                let (prio, id, durable, size) = match (r, m) {
                    (Some(r), _) => (Priority::new(r.prio)?, r.id, r.durable, r.byte_size),
                    (None, Some(m)) => (Priority::NORM, m.id, m.durable, m.byte_size),
                    (None, None) => {
                        return Err(StoreError::IllegalArgument("dummy entry without rows".into()))
                    }
                };
                let content = m.and_then(|m| m.content.clone()).unwrap_or_default();
                DummyEntry::restore(prio, id, durable, size, Bytes::from(content)).into()
            }
        };
        Ok(entry)
    }
}
