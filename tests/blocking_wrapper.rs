mod common;

use std::thread;
use std::time::{Duration, Instant};

use blipstore::core::storage::Storage;
use blipstore::{BlockingQueueWrapper, StorageId, StoreContext, StoreError};

use common::{config_in, dummy, init_logging, ram_queue};

#[test]
fn partial_result_after_timeout() {
    init_logging();
    let q = ram_queue("callback:/node/test/client/joe/1", -1);
    let wrapper = BlockingQueueWrapper::with_poll_interval(q.clone(), 50);

    let producer = {
        let q = q.clone();
        thread::spawn(move || {
            for id in 1..=3 {
                thread::sleep(Duration::from_millis(20));
                q.put(dummy(5, id), false).unwrap();
            }
        })
    };

    let started = Instant::now();
    let found = wrapper.blocking_peek(10, 200).unwrap();
    producer.join().unwrap();

    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(found.len(), 3);
    assert_eq!(q.num_entries(), 3);
}

#[test]
fn any_entry_satisfies_minus_one() {
    let q = ram_queue("callback:/node/test/client/joe/1", -1);
    let wrapper = BlockingQueueWrapper::with_poll_interval(q.clone(), 5_000);
    let producer = {
        let q = q.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            q.put_all(vec![dummy(5, 1), dummy(3, 2)], false).unwrap();
        })
    };

    let taken = wrapper.blocking_take(-1, 2_000).unwrap();
    producer.join().unwrap();
    assert_eq!(taken.len(), 2);
    assert_eq!(q.num_entries(), 0);
}

#[test]
fn priority_window_waits_for_matching_entries() {
    let q = ram_queue("callback:/node/test/client/joe/1", -1);
    q.put(dummy(1, 1), false).unwrap();
    let wrapper = BlockingQueueWrapper::with_poll_interval(q.clone(), 20);

    assert!(wrapper.blocking_peek_with_priority(1, 60, 7, 9).unwrap().is_empty());

    q.put(dummy(8, 2), false).unwrap();
    let taken = wrapper.blocking_take_with_priority(1, 60, 7, 9).unwrap();
    assert_eq!(taken.len(), 1);
    assert_eq!(taken[0].unique_id(), 2);
    assert_eq!(q.num_entries(), 1);
}

#[test]
fn same_priority_and_lowest_variants() {
    let q = ram_queue("callback:/node/test/client/joe/1", -1);
    q.put_all(vec![dummy(7, 1), dummy(7, 2), dummy(3, 3)], false).unwrap();
    let wrapper = BlockingQueueWrapper::new(q.clone());

    let same = wrapper.blocking_peek_same_priority(-1, 0).unwrap();
    assert_eq!(same.iter().map(|e| e.unique_id()).collect::<Vec<_>>(), vec![1, 2]);

    let lowest = wrapper.blocking_peek_lowest(1, 0, None, false).unwrap();
    assert_eq!(lowest[0].unique_id(), 3);
}

#[test]
fn shutdown_wakes_and_fails_waiter() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = StoreContext::open(config_in(dir.path(), "")).unwrap();
    let id = StorageId::parse("callback:/node/test/client/joe/1").unwrap();
    let wrapper = std::sync::Arc::new(ctx.blocking(&id).unwrap());
    assert_eq!(wrapper.poll_interval(), Duration::from_millis(1000));

    let waiter = {
        let wrapper = wrapper.clone();
        thread::spawn(move || wrapper.blocking_take(1, -1))
    };
    thread::sleep(Duration::from_millis(50));
    wrapper.shutdown();

    let outcome = waiter.join().unwrap();
    assert!(matches!(outcome, Err(StoreError::StorageGone)));
    assert!(wrapper.is_shutdown());
    assert!(!ctx.open_storage(&id).unwrap().has_storage_size_listener(None));
}
