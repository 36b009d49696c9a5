use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;

use blipstore::core::entry::{DummyEntry, Entry};
use blipstore::core::factory::EntryFactory;
use blipstore::core::priority::Priority;
use blipstore::core::storage::{JournalOptions, JournalQueue, QueueProperty, RamQueue, Storage};
use blipstore::StorageId;

fn create_entries(count: usize) -> Vec<Entry> {
    (0..count)
        .map(|i| {
            let priority = Priority::new((i % 10) as i32).unwrap_or(Priority::NORM);
            DummyEntry::with_id(priority, i as i64 + 1, false, 1024).into()
        })
        .collect()
}

fn storage_id() -> StorageId {
    StorageId::parse("callback:/node/bench/client/joe/1").unwrap()
}

fn bench_ram_put_take(c: &mut Criterion) {
    let mut group = c.benchmark_group("ram_put_take");

    for &size in [1000, 10_000].iter() {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("put_then_drain", size), &size, |b, &size| {
            let queue = RamQueue::new(storage_id(), QueueProperty::unlimited());
            let entries = create_entries(size);

            b.iter(|| {
                for entry in &entries {
                    black_box(queue.put(entry.clone(), true).unwrap());
                }
                black_box(queue.take_n(-1, -1).unwrap());
            });
        });
    }

    group.finish();
}

fn bench_ram_peek_priority(c: &mut Criterion) {
    let mut group = c.benchmark_group("ram_peek_priority");

    group.bench_function("peek_with_priority_100_of_10000", |b| {
        let queue = RamQueue::new(storage_id(), QueueProperty::unlimited());
        queue.put_all(create_entries(10_000), true).unwrap();

        b.iter(|| {
            black_box(queue.peek_with_priority(100, -1, 3, 7).unwrap());
        });
    });

    group.finish();
}

fn bench_journal_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("journal_put");
    group.sample_size(20);

    for &size in [100, 1000].iter() {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("put_then_clear", size), &size, |b, &size| {
            let dir = tempfile::tempdir().unwrap();
            let queue = JournalQueue::open(
                storage_id(),
                QueueProperty::unlimited(),
                dir.path(),
                Arc::new(EntryFactory::new()),
                JournalOptions::default(),
            )
            .unwrap();
            let entries = create_entries(size);

            b.iter(|| {
                queue.put_all(entries.clone(), true).unwrap();
                black_box(queue.clear().unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_ram_put_take, bench_ram_peek_priority, bench_journal_put);
criterion_main!(benches);
