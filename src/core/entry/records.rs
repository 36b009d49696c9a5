//! Entries that own their data outright.

use bytes::Bytes;

use crate::core::entry::{EmbeddedType, EntryHeader};
use crate::core::meat::{payload_size_estimate, MsgUnit};
use crate::core::priority::Priority;
use crate::core::timestamp;

const RECORD_OVERHEAD_BYTES: i64 = 100;

/// A topic definition kept in the topic store.
#[derive(Debug)]
pub struct TopicEntry {
    header: EntryHeader,
    msg_unit: MsgUnit,
}

impl TopicEntry {
    pub fn new(msg_unit: MsgUnit) -> Self {
        Self::build(msg_unit, EmbeddedType::TopicXml, None)
    }

    pub fn restore(msg_unit: MsgUnit, embedded_type: EmbeddedType, size_in_bytes: i64) -> Self {
        Self::build(msg_unit, embedded_type, Some(size_in_bytes))
    }

    fn build(msg_unit: MsgUnit, embedded_type: EmbeddedType, stored_size: Option<i64>) -> Self {
        let estimate = payload_size_estimate(&msg_unit);
        let header = EntryHeader::new(
            msg_unit.qos.priority,
            msg_unit.qos.rcv_timestamp,
            msg_unit.qos.persistent,
            EntryHeader::settle_size(embedded_type, estimate, stored_size),
            embedded_type,
        );
        Self { header, msg_unit }
    }

    pub fn header(&self) -> &EntryHeader {
        &self.header
    }

    pub fn msg_unit(&self) -> &MsgUnit {
        &self.msg_unit
    }
}

/// Login state of a client session, replayed after restart.
#[derive(Debug)]
pub struct SessionEntry {
    header: EntryHeader,
    literal: String,
}

impl SessionEntry {
    pub fn new(literal: impl Into<String>) -> Self {
        let literal = literal.into();
        let size = RECORD_OVERHEAD_BYTES + literal.len() as i64;
        Self::restore(timestamp::next_unique_id(), size, literal)
    }

    pub fn restore(unique_id: i64, size_in_bytes: i64, literal: String) -> Self {
        let header = EntryHeader::new(
            Priority::NORM,
            unique_id,
            true,
            size_in_bytes,
            EmbeddedType::Session,
        );
        Self { header, literal }
    }

    pub fn header(&self) -> &EntryHeader {
        &self.header
    }

    pub fn literal(&self) -> &str {
        &self.literal
    }
}

/// A durable subscription, replayed after restart.
#[derive(Debug)]
pub struct SubscribeEntry {
    header: EntryHeader,
    key_literal: String,
    qos_literal: String,
    session_name: String,
}

impl SubscribeEntry {
    pub fn new(
        key_literal: impl Into<String>,
        qos_literal: impl Into<String>,
        session_name: impl Into<String>,
    ) -> Self {
        let key_literal = key_literal.into();
        let qos_literal = qos_literal.into();
        let session_name = session_name.into();
        let size = RECORD_OVERHEAD_BYTES
            + (key_literal.len() + qos_literal.len() + session_name.len()) as i64;
        Self::restore(timestamp::next_unique_id(), size, key_literal, qos_literal, session_name)
    }

    pub fn restore(
        unique_id: i64,
        size_in_bytes: i64,
        key_literal: String,
        qos_literal: String,
        session_name: String,
    ) -> Self {
        let header = EntryHeader::new(
            Priority::NORM,
            unique_id,
            true,
            size_in_bytes,
            EmbeddedType::Subscribe,
        );
        Self {
            header,
            key_literal,
            qos_literal,
            session_name,
        }
    }

    pub fn header(&self) -> &EntryHeader {
        &self.header
    }

    pub fn key_literal(&self) -> &str {
        &self.key_literal
    }

    pub fn qos_literal(&self) -> &str {
        &self.qos_literal
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }
}

/// Opaque entry with a caller-chosen footprint, used in tests and benches.
#[derive(Debug)]
pub struct DummyEntry {
    header: EntryHeader,
    content: Bytes,
}

impl DummyEntry {
    pub fn new(priority: Priority, persistent: bool, size_in_bytes: i64) -> Self {
        Self::with_id(priority, timestamp::next_unique_id(), persistent, size_in_bytes)
    }

    pub fn with_id(priority: Priority, unique_id: i64, persistent: bool, size_in_bytes: i64) -> Self {
        Self::restore(priority, unique_id, persistent, size_in_bytes, Bytes::new())
    }

    pub fn restore(
        priority: Priority,
        unique_id: i64,
        persistent: bool,
        size_in_bytes: i64,
        content: Bytes,
    ) -> Self {
        let header = EntryHeader::new(
            priority,
            unique_id,
            persistent,
            size_in_bytes,
            EmbeddedType::Dummy,
        );
        Self { header, content }
    }

    pub fn with_content(mut self, content: impl Into<Bytes>) -> Self {
        self.content = content.into();
        self
    }

    pub fn header(&self) -> &EntryHeader {
        &self.header
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }
}
