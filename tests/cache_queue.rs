mod common;

use std::sync::Arc;

use blipstore::core::entry::Entry;
use blipstore::core::factory::EntryFactory;
use blipstore::core::storage::{CacheQueue, JournalOptions, QueueProperty, Storage};
use blipstore::StorageId;

use common::dummy;

fn open(dir: &std::path::Path, cache_max_entries: i64) -> CacheQueue {
    let property = QueueProperty {
        cache_max_entries,
        ..QueueProperty::unlimited()
    };
    CacheQueue::open(
        StorageId::parse("callback:/node/test/client/joe/1").unwrap(),
        property,
        dir,
        Arc::new(EntryFactory::new()),
        JournalOptions::default(),
    )
    .unwrap()
}

fn ids(entries: &[Entry]) -> Vec<i64> {
    entries.iter().map(Entry::unique_id).collect()
}

#[test]
fn selection_spans_both_tiers() {
    let dir = tempfile::tempdir().unwrap();
    let q = open(dir.path(), 2);
    q.put_all(vec![dummy(3, 1), dummy(9, 2), dummy(5, 3), dummy(9, 4), dummy(1, 5)], false)
        .unwrap();
    assert_eq!(q.num_entries(), 5);

    assert_eq!(ids(&q.peek_n(-1, -1).unwrap()), vec![2, 4, 3, 1, 5]);
    assert_eq!(ids(&q.peek_with_priority(-1, -1, 3, 5).unwrap()), vec![3, 1]);
    assert_eq!(ids(&q.peek_same_priority(-1, -1).unwrap()), vec![2, 4]);
}

#[test]
fn targeted_removal_reports_presence() {
    let dir = tempfile::tempdir().unwrap();
    let q = open(dir.path(), 1);
    let entries = vec![dummy(5, 1), dummy(5, 2), dummy(5, 3)];
    q.put_all(entries.clone(), false).unwrap();

    let removed = q.remove_random_all(&[entries[2].clone(), dummy(5, 42)]).unwrap();
    assert_eq!(removed, vec![true, false]);
    assert!(!q.remove_random(&entries[2]).unwrap());
    assert_eq!(q.entry_references().unwrap(), vec![1, 2]);
}

#[test]
fn filter_sees_every_entry() {
    let dir = tempfile::tempdir().unwrap();
    let q = open(dir.path(), 1);
    q.put_all((1..=4).map(|id| dummy(5, id)).collect(), false).unwrap();

    let even = |e: Entry| (e.unique_id() % 2 == 0).then_some(e);
    let kept = q.entries(Some(&even)).unwrap();
    assert_eq!(ids(&kept), vec![2, 4]);
}

#[test]
fn clear_empties_both_tiers() {
    let dir = tempfile::tempdir().unwrap();
    let q = open(dir.path(), 1);
    q.put_all((1..=3).map(|id| dummy(5, id)).collect(), false).unwrap();
    assert_eq!(q.clear().unwrap(), 3);
    assert_eq!(q.num_entries(), 0);
    assert_eq!(q.num_bytes(), 0);
    assert_eq!(q.resident_entries(), 0);
    assert!(q.peek().unwrap().is_none());
}
