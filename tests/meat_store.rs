mod common;

use std::sync::Arc;
use std::time::Duration;

use blipstore::core::entry::Entry;
use blipstore::core::meat::{MeatEntry, MeatStore, MsgKey, MsgQos, MsgUnit};
use blipstore::core::priority::Priority;
use blipstore::core::storage::Storage;
use blipstore::{StorageId, StoreContext};

use common::{config_in, init_logging, message};

fn short_lived(oid: &str, lifetime_ms: i64) -> MsgUnit {
    MsgUnit::new(
        MsgKey::new(oid),
        MsgQos::new(Priority::NORM, false).with_lifetime(lifetime_ms),
        "soon gone",
    )
}

#[tokio::test]
async fn background_sweeper_drops_expired_payloads() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config_in(dir.path(), "");
    cfg.meat.expiry_sweep_interval_ms = 10;
    let ctx = StoreContext::open(cfg).unwrap();
    let sweeper = ctx.spawn_background().expect("sweeper enabled");

    let sub = StorageId::parse("callback:/node/test/client/joe/1").unwrap();
    let meat = ctx.publish(short_lived("flash", 20), &[sub.clone()]).unwrap();
    assert_eq!(ctx.meat_store().len(), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(ctx.meat_store().is_empty());
    assert!(ctx.meat_store().stats().expired >= 1);

    let entry = ctx.open_storage(&sub).unwrap().peek().unwrap().unwrap();
    let Entry::Update(update) = entry else {
        panic!("expected update reference");
    };
    assert!(update.resolve_classified().unwrap_err().is_benign());
    assert_eq!(update.link().meat_unique_id(), meat.unique_id());

    sweeper.abort();
    ctx.shutdown();
}

#[test]
fn sweeper_disabled_by_config() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config_in(dir.path(), "");
    cfg.meat.expiry_sweep_interval_ms = 0;
    let ctx = StoreContext::open(cfg).unwrap();
    assert!(ctx.spawn_background().is_none());
}

#[test]
fn memory_pressure_swaps_persistent_payloads() {
    let dir = tempfile::tempdir().unwrap();
    let journaled_subjects = "[queues.subject]\nkind = \"journal\"";
    let sub = StorageId::parse("subject:/node/test/client/joe").unwrap();
    let published: Vec<MsgUnit> = (0..4)
        .map(|i| message(&format!("t{i}"), Priority::NORM, true))
        .collect();
    {
        let ctx = StoreContext::open(config_in(dir.path(), journaled_subjects)).unwrap();
        for unit in &published {
            ctx.publish(unit.clone(), &[sub.clone()]).unwrap();
        }
        ctx.shutdown();
    }

    let mut cfg = config_in(dir.path(), journaled_subjects);
    cfg.meat.max_resident_bytes = 0;
    let ctx = StoreContext::open(cfg).unwrap();
    assert_eq!(ctx.meat_store().len(), 4);
    assert_eq!(ctx.meat_store().resident_bytes(), 0);
    assert_eq!(ctx.meat_store().stats().swapped_out, 4);

    let entries = ctx.open_storage(&sub).unwrap().peek_n(-1, -1).unwrap();
    let reloaded: Vec<MsgUnit> = entries
        .iter()
        .map(|e| e.meat().expect("payload reloads").msg_unit().clone())
        .collect();
    assert_eq!(reloaded, published);
    assert!(ctx.meat_store().stats().swapped_in >= 4);
    assert_eq!(ctx.meat_store().reference_counts("t0", published[0].qos.rcv_timestamp), Some((1, 0)));
}

#[test]
fn store_without_backing_keeps_everything_resident() {
    let store = MeatStore::new(StorageId::parse("msgUnitStore:/node/solo").unwrap(), None);
    let meat = Arc::new(MeatEntry::new(message("x", Priority::NORM, true), None));
    assert!(store.insert(Arc::clone(&meat)).unwrap());
    assert!(!store.insert(Arc::clone(&meat)).unwrap());
    assert!(!store.swap_out("x", meat.unique_id()));
    assert_eq!(store.relieve_pressure(0), 0);
    assert_eq!(store.len(), 1);
}
