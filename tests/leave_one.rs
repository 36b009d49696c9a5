mod common;

use std::sync::Arc;

use blipstore::core::factory::EntryFactory;
use blipstore::core::storage::{JournalOptions, JournalQueue, QueueProperty, Storage};
use blipstore::StorageId;

use common::{dummy, ram_queue};

const HUGE: i64 = i64::MAX;

fn check_leave_one(storage: &dyn Storage) {
    storage.put(dummy(5, 1), false).unwrap();
    assert!(storage.take_lowest(-1, HUGE, None, true).unwrap().is_empty());
    assert_eq!(storage.num_entries(), 1);

    storage.put(dummy(5, 2), false).unwrap();
    let taken = storage.take_lowest(-1, HUGE, None, true).unwrap();
    assert_eq!(taken.len(), 1);
    assert_eq!(taken[0].unique_id(), 2);
    assert_eq!(storage.peek().unwrap().map(|e| e.unique_id()), Some(1));

    let taken = storage.take_lowest(-1, HUGE, None, false).unwrap();
    assert_eq!(taken.len(), 1);
    assert_eq!(storage.num_entries(), 0);
}

#[test]
fn ram_queue_never_takes_the_last_entry() {
    let q = ram_queue("callback:/node/test/client/joe/1", -1);
    check_leave_one(q.as_ref());
}

#[test]
fn journal_queue_never_takes_the_last_entry() {
    let dir = tempfile::tempdir().unwrap();
    let q = JournalQueue::open(
        StorageId::parse("subject:/node/test/client/joe").unwrap(),
        QueueProperty::unlimited(),
        dir.path(),
        Arc::new(EntryFactory::new()),
        JournalOptions::default(),
    )
    .unwrap();
    check_leave_one(&q);
}

#[test]
fn lowest_is_taken_from_the_tail() {
    let q = ram_queue("callback:/node/test/client/joe/1", -1);
    q.put_all(vec![dummy(9, 1), dummy(1, 2), dummy(5, 3), dummy(1, 4)], false).unwrap();

    let lowest = q.peek_lowest(2, HUGE, None, true).unwrap();
    assert_eq!(lowest.iter().map(|e| e.unique_id()).collect::<Vec<_>>(), vec![4, 2]);

    let limit = dummy(5, 3);
    let below = q.take_lowest(-1, HUGE, Some(&limit), false).unwrap();
    assert_eq!(below.iter().map(|e| e.unique_id()).collect::<Vec<_>>(), vec![4, 2]);
    assert_eq!(q.num_entries(), 2);
}
