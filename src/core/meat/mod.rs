//! Payloads ("meat") shared by many reference entries, and the arena that
//! owns them.

pub mod store;

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::core::entry::{EmbeddedType, EntryHeader};
use crate::core::error::{Result, StoreError};
use crate::core::factory::csv::{csv_to_map, map_to_csv, MetaInfo};
use crate::core::priority::Priority;
use crate::core::storage_id::StorageId;
use crate::core::timestamp;

pub use store::{MeatStore, MeatStoreStats, MeatStoreStatsSnapshot, PayloadPin};

/// Fixed part of the payload footprint estimate.
pub const MEAT_OVERHEAD_BYTES: i64 = 306;

/// Message key: the topic oid plus descriptive attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgKey {
    pub oid: String,
    pub content_mime: String,
    pub domain: Option<String>,
}

impl MsgKey {
    pub fn new(oid: impl Into<String>) -> Self {
        Self {
            oid: oid.into(),
            content_mime: "text/plain".to_string(),
            domain: None,
        }
    }

    pub fn to_literal(&self) -> String {
        let mut map = MetaInfo::new();
        map.insert("oid".into(), self.oid.clone());
        map.insert("contentMime".into(), self.content_mime.clone());
        if let Some(domain) = &self.domain {
            map.insert("domain".into(), domain.clone());
        }
        map_to_csv(&map)
    }

    pub fn parse(literal: &str) -> Result<Self> {
        let map = csv_to_map(literal);
        let oid = map
            .get("oid")
            .filter(|o| !o.is_empty())
            .ok_or_else(|| StoreError::IllegalArgument(format!("key literal without oid: '{literal}'")))?;
        Ok(Self {
            oid: oid.clone(),
            content_mime: map
                .get("contentMime")
                .cloned()
                .unwrap_or_else(|| "text/plain".to_string()),
            domain: map.get("domain").cloned(),
        })
    }
}

/// Delivery attributes of a published message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgQos {
    pub priority: Priority,
    pub persistent: bool,
    /// Receive timestamp in nanoseconds, doubles as the payload unique id.
    pub rcv_timestamp: i64,
    /// Lifetime in milliseconds, negative means unlimited.
    pub lifetime_ms: i64,
    pub sender: Option<String>,
    pub force_destroy: bool,
}

impl MsgQos {
    pub fn new(priority: Priority, persistent: bool) -> Self {
        Self {
            priority,
            persistent,
            rcv_timestamp: timestamp::next_unique_id(),
            lifetime_ms: -1,
            sender: None,
            force_destroy: false,
        }
    }

    pub fn with_lifetime(mut self, lifetime_ms: i64) -> Self {
        self.lifetime_ms = lifetime_ms;
        self
    }

    /// Absolute expiry in epoch milliseconds.
    pub fn expires_at(&self) -> Option<u64> {
        (self.lifetime_ms >= 0)
            .then(|| timestamp::nanos_to_millis(self.rcv_timestamp) + self.lifetime_ms as u64)
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at().is_some_and(|at| at <= now_ms)
    }

    pub fn to_literal(&self) -> String {
        let mut map = MetaInfo::new();
        map.insert("priority".into(), self.priority.to_string());
        map.insert("persistent".into(), self.persistent.to_string());
        map.insert("rcvTimestamp".into(), self.rcv_timestamp.to_string());
        map.insert("lifeTime".into(), self.lifetime_ms.to_string());
        map.insert("forceDestroy".into(), self.force_destroy.to_string());
        if let Some(sender) = &self.sender {
            map.insert("sender".into(), sender.clone());
        }
        map_to_csv(&map)
    }

    pub fn parse(literal: &str) -> Result<Self> {
        let map = csv_to_map(literal);
        let num = |key: &str| -> Result<Option<i64>> {
            map.get(key)
                .map(|v| {
                    v.parse::<i64>().map_err(|e| {
                        StoreError::IllegalArgument(format!("qos attribute {key}='{v}': {e}"))
                    })
                })
                .transpose()
        };
        let flag = |key: &str| map.get(key).is_some_and(|v| v == "true");

        let priority = match num("priority")? {
            Some(p) => Priority::new(p as i32)?,
            None => Priority::NORM,
        };
        let rcv_timestamp = num("rcvTimestamp")?.ok_or_else(|| {
            StoreError::IllegalArgument(format!("qos literal without rcvTimestamp: '{literal}'"))
        })?;
        Ok(Self {
            priority,
            persistent: flag("persistent"),
            rcv_timestamp,
            lifetime_ms: num("lifeTime")?.unwrap_or(-1),
            sender: map.get("sender").cloned(),
            force_destroy: flag("forceDestroy"),
        })
    }
}

/// Key, QoS and content of one published message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgUnit {
    pub key: MsgKey,
    pub qos: MsgQos,
    pub content: Bytes,
}

impl MsgUnit {
    pub fn new(key: MsgKey, qos: MsgQos, content: impl Into<Bytes>) -> Self {
        Self {
            key,
            qos,
            content: content.into(),
        }
    }

    pub fn key_oid(&self) -> &str {
        &self.key.oid
    }
}

/// Rough footprint of a payload: fixed overhead plus its variable parts.
pub(crate) fn payload_size_estimate(msg_unit: &MsgUnit) -> i64 {
    MEAT_OVERHEAD_BYTES
        + msg_unit.content.len() as i64
        + msg_unit.key.to_literal().len() as i64
        + msg_unit.qos.to_literal().len() as i64
}

/// A payload-owning entry held in the message store.
///
/// The reference counters are the values at construction or at the last
/// persisted snapshot; the live counts belong to the owning [`MeatStore`] slot.
#[derive(Debug)]
pub struct MeatEntry {
    header: EntryHeader,
    msg_unit: MsgUnit,
    storage_id: Option<StorageId>,
    reference_count: i32,
    history_reference_count: i32,
    swapped: AtomicBool,
}

impl MeatEntry {
    pub fn new(msg_unit: MsgUnit, storage_id: Option<StorageId>) -> Self {
        Self::build(msg_unit, storage_id, EmbeddedType::MsgXml, 0, 0, None)
    }

    /// Rebuilds a payload from a persisted row. `size_in_bytes` is kept as stored.
    pub fn restore(
        msg_unit: MsgUnit,
        storage_id: Option<StorageId>,
        embedded_type: EmbeddedType,
        reference_count: i32,
        history_reference_count: i32,
        size_in_bytes: i64,
    ) -> Self {
        Self::build(
            msg_unit,
            storage_id,
            embedded_type,
            reference_count,
            history_reference_count,
            Some(size_in_bytes),
        )
    }

    fn build(
        msg_unit: MsgUnit,
        storage_id: Option<StorageId>,
        embedded_type: EmbeddedType,
        reference_count: i32,
        history_reference_count: i32,
        stored_size: Option<i64>,
    ) -> Self {
        let estimate = payload_size_estimate(&msg_unit);
        let header = EntryHeader::new(
            msg_unit.qos.priority,
            msg_unit.qos.rcv_timestamp,
            msg_unit.qos.persistent,
            EntryHeader::settle_size(embedded_type, estimate, stored_size),
            embedded_type,
        );
        Self {
            header,
            msg_unit,
            storage_id,
            reference_count,
            history_reference_count,
            swapped: AtomicBool::new(false),
        }
    }

    /// Same payload carrying the given counters, for persisting a snapshot.
    pub fn with_counters(&self, reference_count: i32, history_reference_count: i32) -> Self {
        Self {
            header: self.header.clone(),
            msg_unit: self.msg_unit.clone(),
            storage_id: self.storage_id.clone(),
            reference_count,
            history_reference_count,
            swapped: AtomicBool::new(false),
        }
    }

    pub fn header(&self) -> &EntryHeader {
        &self.header
    }

    pub fn msg_unit(&self) -> &MsgUnit {
        &self.msg_unit
    }

    pub fn key_oid(&self) -> &str {
        self.msg_unit.key_oid()
    }

    pub fn unique_id(&self) -> i64 {
        self.header.unique_id()
    }

    pub fn storage_id(&self) -> Option<&StorageId> {
        self.storage_id.as_ref()
    }

    pub fn reference_count(&self) -> i32 {
        self.reference_count
    }

    pub fn history_reference_count(&self) -> i32 {
        self.history_reference_count
    }

    pub fn expires_at(&self) -> Option<u64> {
        self.msg_unit.qos.expires_at()
    }

    pub fn is_expired(&self) -> bool {
        self.msg_unit.qos.is_expired(timestamp::now_millis())
    }

    pub fn is_swapped(&self) -> bool {
        self.swapped.load(Ordering::Acquire)
    }

    pub(crate) fn mark_swapped(&self) {
        self.swapped.store(true, Ordering::Release);
    }
}
