//! Normalized meat/ref column pair for a relational backing store.

use serde::{Deserialize, Serialize};

use crate::core::entry::EmbeddedType;
use crate::core::storage_id::StorageId;

/// Payload row. Only payload-owning entries produce one.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MeatColumns {
    pub byte_size: i64,
    pub content: Option<Vec<u8>>,
    pub data_type: Option<String>,
    pub durable: bool,
    pub id: i64,
    pub key: Option<String>,
    pub qos: Option<String>,
    pub ref_count: i64,
    /// CSV-encoded `key=value` pairs, see [`csv`](crate::core::factory::csv).
    pub meta_info: Option<String>,
}

/// Ordering and linkage row, produced for every entry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RefColumns {
    pub byte_size: i64,
    pub durable: bool,
    pub id: i64,
    pub meat_id: Option<i64>,
    pub meta_info: Option<String>,
    pub prio: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnPair {
    pub meat: Option<MeatColumns>,
    pub reference: RefColumns,
}

/// The store a column pair was read from; its type picks the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDescriptor {
    pub storage_id: StorageId,
    pub entry_type: EmbeddedType,
}

impl StoreDescriptor {
    pub fn new(storage_id: StorageId, entry_type: EmbeddedType) -> Self {
        Self {
            storage_id,
            entry_type,
        }
    }
}

pub(crate) mod meta {
    pub const KEY_OID: &str = "keyOid";
    pub const RECEIVER: &str = "receiverStr";
    pub const SUBSCRIPTION_ID: &str = "subId";
    pub const FLAG: &str = "flag";
    pub const REDELIVER: &str = "redeliverCounter";
    pub const SESSION_NAME: &str = "sessionName";
}
