#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Once};

use blipstore::core::entry::{DummyEntry, Entry};
use blipstore::core::meat::{MsgKey, MsgQos, MsgUnit};
use blipstore::core::priority::Priority;
use blipstore::core::storage::{QueueProperty, RamQueue};
use blipstore::{StorageId, StoreConfig};

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        blipstore::logging::try_init_logging();
    });
}

/// Config rooted in `dir` with a RAM default queue and an unbounded
/// journal-backed payload store.
pub fn config_in(dir: &Path, extra: &str) -> StoreConfig {
    let raw = format!(
        r#"
        node_id = "test"

        [queues.default]
        kind = "ram"

        [queues.msgUnitStore]
        kind = "journal"
        max_entries = -1
        max_bytes = -1

        {extra}
        "#
    );
    let mut cfg = StoreConfig::from_toml_str(&raw).expect("test config");
    cfg.journal.directory = dir.to_path_buf();
    cfg
}

pub fn ram_queue(id: &str, max_entries: i64) -> Arc<RamQueue> {
    Arc::new(RamQueue::new(
        StorageId::parse(id).expect("storage id"),
        QueueProperty::unlimited().with_max_entries(max_entries),
    ))
}

pub fn dummy(priority: i32, unique_id: i64) -> Entry {
    let priority = Priority::new(priority).expect("priority");
    DummyEntry::with_id(priority, unique_id, false, 16).into()
}

pub fn message(oid: &str, priority: Priority, persistent: bool) -> MsgUnit {
    MsgUnit::new(MsgKey::new(oid), MsgQos::new(priority, persistent), format!("payload of {oid}"))
}
