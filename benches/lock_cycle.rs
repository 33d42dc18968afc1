//! Benchmarks for the manager's queued hot paths.
//!
//! - Lock/unlock of a resident buffer (one queue round trip each way)
//! - Dump followed by restore (file write + read)
//!
//! Run with: cargo bench --bench lock_cycle

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use spillable_buffer::{BufferManager, ManagerConfig, ManagerHandleExt};

fn bench_lock_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer/lock");
    let manager = BufferManager::new(ManagerConfig::default()).unwrap();

    for size in [64usize, 64 * 1024, 4 * 1024 * 1024] {
        let handle = manager.new_handle().unwrap();
        handle.allocate(size).unwrap();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("const_lock", size), &size, |b, _| {
            b.iter(|| {
                let lock = handle.const_lock().unwrap();
                black_box(lock.get_buffer());
            });
        });
    }

    group.finish();
}

fn bench_dump_restore(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer/dump_restore");
    let manager = BufferManager::new(ManagerConfig::default()).unwrap();

    for size in [4 * 1024usize, 1024 * 1024] {
        let handle = manager.new_handle().unwrap();
        handle.allocate(size).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("round_trip", size), &size, |b, _| {
            b.iter(|| {
                manager.dump(handle.id()).wait().unwrap();
                black_box(manager.restore(handle.id()).wait().unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_lock_cycle, bench_dump_restore);
criterion_main!(benches);
