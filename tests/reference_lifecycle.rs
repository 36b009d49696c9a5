mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use blipstore::core::entry::{Entry, MissKind, UpdateFlag};
use blipstore::core::priority::Priority;
use blipstore::core::storage::{PutListener, Storage};
use blipstore::{StorageId, StoreContext};

use common::{config_in, init_logging, message};

fn callback(session: u32) -> StorageId {
    StorageId::parse(&format!("callback:/node/test/client/joe/{session}")).unwrap()
}

#[test]
fn fanout_then_release_discards_payload() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let ctx = StoreContext::open(config_in(dir.path(), "")).unwrap();
    let destinations: Vec<StorageId> = (1..=3).map(callback).collect();

    let meat = ctx
        .publish(message("news", Priority::NORM, false), &destinations)
        .unwrap();
    assert_eq!(ctx.meat_store().reference_counts("news", meat.unique_id()), Some((3, 0)));

    let mut released = Vec::new();
    for id in &destinations {
        let entry = ctx.open_storage(id).unwrap().take().unwrap().unwrap();
        released.push(entry);
    }
    assert_eq!(ctx.meat_store().reference_counts("news", meat.unique_id()), None);
    assert!(ctx.meat_store().is_empty());

    for entry in released {
        let Entry::Update(update) = entry else {
            panic!("expected update reference");
        };
        let kind = update.resolve_classified().unwrap_err();
        assert_eq!(kind, MissKind::Released);
        assert!(kind.is_benign());
    }
    ctx.shutdown();
}

#[test]
fn concurrent_fanout_counts_every_reference() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = Arc::new(StoreContext::open(config_in(dir.path(), "")).unwrap());
    let history = StorageId::parse("history:/node/test/topic/burst").unwrap();
    let meat = ctx
        .publish(message("burst", Priority::HIGH, false), &[history.clone()])
        .unwrap();

    let workers: Vec<_> = (0..8)
        .map(|session| {
            let ctx = Arc::clone(&ctx);
            let meat = Arc::clone(&meat);
            std::thread::spawn(move || {
                ctx.enqueue(&callback(session), &meat, UpdateFlag::new("OK")).unwrap();
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(ctx.meat_store().reference_counts("burst", meat.unique_id()), Some((8, 1)));

    for session in 0..8 {
        let storage = ctx.open_storage(&callback(session)).unwrap();
        assert_eq!(storage.remove().unwrap(), 1);
    }
    ctx.open_storage(&history).unwrap().clear().unwrap();
    assert!(ctx.meat_store().is_empty());
}

#[test]
fn racing_first_opens_count_every_reference() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = Arc::new(StoreContext::open(config_in(dir.path(), "")).unwrap());
    let history = StorageId::parse("history:/node/test/topic/shared").unwrap();
    let meat = ctx
        .publish(message("shared", Priority::NORM, false), &[history])
        .unwrap();
    let shared = callback(42);
    let start = Arc::new(Barrier::new(8));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let (ctx, meat, shared, start) = (Arc::clone(&ctx), Arc::clone(&meat), shared.clone(), Arc::clone(&start));
            std::thread::spawn(move || {
                start.wait();
                let opened = ctx.open_storage(&shared).unwrap();
                ctx.enqueue(&shared, &meat, UpdateFlag::default()).unwrap();
                opened
            })
        })
        .collect();
    let opened: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    assert!(opened.iter().all(|s| Arc::ptr_eq(s, &opened[0])));
    assert!(opened[0].is_notified_about_add_or_remove());
    assert_eq!(opened[0].num_entries(), 8);
    assert_eq!(ctx.meat_store().reference_counts("shared", meat.unique_id()), Some((8, 1)));
}

/// Takes everything from another storage whenever a put reaches this one.
#[derive(Debug)]
struct DrainOnPut {
    other: Arc<dyn Storage>,
    drained: AtomicUsize,
}

impl PutListener for DrainOnPut {
    fn put_pre(&self, _entries: &[Entry]) -> bool {
        let taken = self.other.take_n(-1, -1).unwrap();
        self.drained.fetch_add(taken.len(), Ordering::SeqCst);
        true
    }

    fn put_post(&self, _entries: &[Entry]) {}
}

#[test]
fn consumer_between_destinations_keeps_payload_alive() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = StoreContext::open(config_in(dir.path(), "")).unwrap();
    let (first, second) = (callback(1), callback(2));
    let drain = Arc::new(DrainOnPut {
        other: ctx.open_storage(&first).unwrap(),
        drained: AtomicUsize::new(0),
    });
    ctx.open_storage(&second).unwrap().add_put_listener(drain.clone()).unwrap();

    let meat = ctx
        .publish(message("race", Priority::NORM, false), &[first, second.clone()])
        .unwrap();
    assert_eq!(drain.drained.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.meat_store().reference_counts("race", meat.unique_id()), Some((1, 0)));

    let Some(Entry::Update(update)) = ctx.open_storage(&second).unwrap().peek().unwrap() else {
        panic!("expected update reference");
    };
    assert!(Arc::ptr_eq(&update.resolve_classified().unwrap(), &meat));
}

#[test]
fn fanout_survives_a_concurrent_consumer() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let ctx = Arc::new(StoreContext::open(config_in(dir.path(), "")).unwrap());
    let (first, second) = (callback(1), callback(2));
    let done = Arc::new(AtomicBool::new(false));

    let consumer = {
        let (ctx, first, done) = (Arc::clone(&ctx), first.clone(), Arc::clone(&done));
        std::thread::spawn(move || {
            let storage = ctx.open_storage(&first).unwrap();
            while !done.load(Ordering::SeqCst) {
                storage.take_n(-1, -1).unwrap();
            }
            storage.take_n(-1, -1).unwrap();
        })
    };
    for i in 0..200 {
        ctx.publish(message(&format!("m{i}"), Priority::NORM, false), &[first.clone(), second.clone()])
            .unwrap();
    }
    done.store(true, Ordering::SeqCst);
    consumer.join().unwrap();

    let storage = ctx.open_storage(&second).unwrap();
    let kept = storage.peek_n(-1, -1).unwrap();
    assert_eq!(kept.len(), 200);
    for entry in &kept {
        let Entry::Update(update) = entry else {
            panic!("expected update reference");
        };
        assert!(update.resolve().is_some(), "payload {} dropped early", update.link().meat_unique_id());
    }
    storage.take_n(-1, -1).unwrap();
    assert!(ctx.meat_store().is_empty());
}

#[test]
fn history_keeps_payload_alive_after_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = StoreContext::open(config_in(dir.path(), "")).unwrap();
    let history = StorageId::parse("history:/node/test/topic/news").unwrap();
    let meat = ctx
        .publish(message("news", Priority::NORM, false), &[callback(1), history.clone()])
        .unwrap();

    ctx.open_storage(&callback(1)).unwrap().remove().unwrap();
    assert_eq!(ctx.meat_store().reference_counts("news", meat.unique_id()), Some((0, 1)));

    let kept = ctx.open_storage(&history).unwrap().peek().unwrap().unwrap();
    assert!(Arc::ptr_eq(&kept.meat().unwrap(), &meat));

    ctx.open_storage(&history).unwrap().clear().unwrap();
    assert!(ctx.meat_store().is_empty());
}
