use std::path::PathBuf;

use blipstore::config::{load_config, StoreConfig};
use blipstore::core::storage::StorageKind;

#[test]
fn load_config_matches_toml_and_env_overrides() {
    let cfg: StoreConfig = load_config("blipstore.toml").expect("failed to load config");

    assert_eq!(cfg.node_id, "node-1");
    assert_eq!(cfg.journal.directory, PathBuf::from("./blipstore-data"));
    assert_eq!(cfg.journal.fsync_every_n, Some(64));
    assert_eq!(cfg.journal.compact_min_bytes, 4_194_304);
    assert_eq!(cfg.blocking.poll_interval_ms, 1000);
    assert_eq!(cfg.meat.max_resident_bytes, 67_108_864);
    assert_eq!(cfg.default_queue.kind, StorageKind::Cache);
    assert_eq!(cfg.default_queue.max_entries, 1000);

    let store = cfg.queue_settings("msgUnitStore");
    assert_eq!(store.kind, StorageKind::Journal);
    assert_eq!(store.max_entries, -1);
    let history = cfg.queue_settings("history");
    assert_eq!(history.kind, StorageKind::Cache);
    assert_eq!(history.max_entries, 10);
    assert!(cfg.queue_settings("topicStore").embedded);
    assert_eq!(cfg.thresholds.len(), 2);

    std::env::set_var("BLIPSTORE_NODE_ID", "from-env");
    std::env::set_var("BLIPSTORE_FSYNC_EVERY_N", "0");
    std::env::set_var("BLIPSTORE_THRESHOLDS", "topic/t/queue/history/event/threshold.3, ");
    let cfg = load_config("blipstore.toml").expect("env overrides");
    assert_eq!(cfg.node_id, "from-env");
    assert_eq!(cfg.journal.fsync_every_n, None);
    assert_eq!(cfg.thresholds, vec!["topic/t/queue/history/event/threshold.3".to_string()]);

    std::env::set_var("BLIPSTORE_POLL_INTERVAL_MS", "soon");
    let err = load_config("blipstore.toml").unwrap_err();
    assert!(err.to_string().contains("BLIPSTORE_POLL_INTERVAL_MS"));

    for var in [
        "BLIPSTORE_NODE_ID",
        "BLIPSTORE_FSYNC_EVERY_N",
        "BLIPSTORE_THRESHOLDS",
        "BLIPSTORE_POLL_INTERVAL_MS",
    ] {
        std::env::remove_var(var);
    }
}
