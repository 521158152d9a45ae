//! Throughput Benchmark for filekv
//!
//! This benchmark measures the line codec, the storage engine and the
//! full store under various workloads.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use filekv::storage::{codec, LockConfig, StorageEngine};
use filekv::{Store, StoreConfig};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Builds file content with `n` records `key<i>:<i>`
fn content(n: usize) -> String {
    (0..n).map(|i| format!("key{}:{}\n", i, i)).collect()
}

fn engine(dir: &TempDir, records: usize) -> StorageEngine {
    let engine = StorageEngine::new(dir.path().join("db.txt"), LockConfig::default());
    engine.reset().unwrap();
    for i in 0..records {
        engine.set(&format!("key{}", i), i as i64).unwrap();
    }
    engine
}

/// Benchmark the line codec on a 1000-record file
fn bench_codec(c: &mut Criterion) {
    let text = content(1_000);

    let mut group = c.benchmark_group("codec");
    group.throughput(Throughput::Elements(1));

    group.bench_function("find_last", |b| {
        b.iter(|| black_box(codec::find(&text, "key999")));
    });

    group.bench_function("find_missing", |b| {
        b.iter(|| black_box(codec::find(&text, "missing")));
    });

    group.bench_function("upsert_existing", |b| {
        b.iter(|| black_box(codec::upsert(&text, "key500", 42)));
    });

    group.bench_function("remove_batch", |b| {
        let keys: Vec<String> = (0..100).map(|i| format!("key{}", i * 10)).collect();
        b.iter(|| black_box(codec::remove(&text, &keys)));
    });

    group.finish();
}

/// Benchmark SET operations
fn bench_set(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, 100);

    let mut group = c.benchmark_group("set");
    group.throughput(Throughput::Elements(1));

    group.bench_function("overwrite", |b| {
        let mut i = 0u64;
        b.iter(|| {
            engine.set(&format!("key{}", i % 100), i as i64).unwrap();
            i += 1;
        });
    });

    group.bench_function("without_marker", |b| {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::new(
            dir.path().join("db.txt"),
            LockConfig {
                use_marker_file: false,
                ..Default::default()
            },
        );
        engine.reset().unwrap();
        let mut i = 0u64;
        b.iter(|| {
            engine.set(&format!("key{}", i % 100), i as i64).unwrap();
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark GET operations
fn bench_get(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, 100);

    let mut group = c.benchmark_group("get");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_existing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            black_box(engine.get(&format!("key{}", i % 100)).unwrap());
            i += 1;
        });
    });

    group.bench_function("get_missing", |b| {
        b.iter(|| black_box(engine.get("missing").unwrap()));
    });

    group.finish();
}

/// Benchmark batch removal against a freshly filled file
fn bench_remove(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, 0);
    let keys: Vec<String> = (0..50).map(|i| format!("key{}", i)).collect();

    let mut group = c.benchmark_group("remove");

    group.bench_function("remove_many_50", |b| {
        b.iter_batched(
            || std::fs::write(engine.path(), content(100)).unwrap(),
            |_| black_box(engine.remove_many(&keys).unwrap()),
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

/// Benchmark concurrent access
fn bench_concurrent(c: &mut Criterion) {
    use std::thread;

    let mut group = c.benchmark_group("concurrent");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("4_threads_mixed", |b| {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(engine(&dir, 0));

        b.iter(|| {
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let engine = Arc::clone(&engine);
                    thread::spawn(move || {
                        for i in 0..50 {
                            let key = format!("key{}x{}", t, i % 10);
                            engine.set(&key, i).unwrap();
                            engine.get(&key).unwrap();
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }
        });
    });

    group.finish();
}

/// Benchmark the full store: scheduler, executor and engine
fn bench_store(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();
    let dir = TempDir::new().unwrap();

    let mut group = c.benchmark_group("store");
    group.throughput(Throughput::Elements(100));

    for (name, inline) in [("burst_100_inline", true), ("burst_100_isolated", false)] {
        let store = Arc::new(
            Store::new(
                StoreConfig::new(dir.path().join(format!("{}.txt", name)))
                    .with_concurrency(4)
                    .with_execute_inline(inline),
            )
            .unwrap(),
        );
        rt.block_on(store.init()).unwrap();

        group.bench_function(name, |b| {
            b.iter(|| {
                rt.block_on(async {
                    let handles: Vec<_> = (0..100)
                        .map(|i| {
                            let store = Arc::clone(&store);
                            tokio::spawn(async move {
                                let key = format!("key{}", i % 26);
                                if i % 2 == 0 {
                                    store.set(&key, i).await.unwrap();
                                } else {
                                    black_box(store.get(&key).await.unwrap());
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.await.unwrap();
                    }
                });
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_codec,
    bench_set,
    bench_get,
    bench_remove,
    bench_concurrent,
    bench_store,
);

criterion_main!(benches);
