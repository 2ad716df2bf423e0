//! Benchmarks for the sharded keyed-state store in admission/src/store
//!
//! Performance-critical paths:
//! - `BoundedStore::upsert`: per-record state update on every stage
//! - `BoundedStore::get`: hit path with recency refresh
//! - Insert under capacity pressure, which triggers global LRU eviction

#![allow(missing_docs)]

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use dbintel_admission::clock::ManualClock;
use dbintel_admission::store::{BoundedStore, StoreConfig};
use std::time::Duration;

fn store(capacity: usize) -> BoundedStore<u64, u64> {
    let config = StoreConfig::new(capacity).with_ttl(Duration::from_secs(600));
    BoundedStore::new(config, ManualClock::new())
}

fn bench_upsert_hot_keys(c: &mut Criterion) {
    let mut group = c.benchmark_group("store/upsert_hot");
    for keys in [16_u64, 1_024, 16_384] {
        let store = store(65_536);
        group.throughput(Throughput::Elements(keys));
        group.bench_with_input(BenchmarkId::from_parameter(keys), &keys, |b, &keys| {
            b.iter(|| {
                for key in 0..keys {
                    store.upsert(black_box(key), || 0, |v| *v += 1);
                }
            });
        });
    }
    group.finish();
}

fn bench_get_hit(c: &mut Criterion) {
    let store = store(4_096);
    for key in 0..4_096 {
        store.put(key, key);
    }
    c.bench_function("store/get_hit", |b| {
        let mut key = 0_u64;
        b.iter(|| {
            key = (key + 7) % 4_096;
            black_box(store.get(black_box(&key)))
        });
    });
}

fn bench_insert_with_eviction(c: &mut Criterion) {
    let mut group = c.benchmark_group("store/insert_evicting");
    for capacity in [64_usize, 1_024, 8_192] {
        let store = store(capacity);
        group.bench_with_input(BenchmarkId::from_parameter(capacity), &capacity, |b, _| {
            let mut next = 0_u64;
            b.iter(|| {
                next += 1;
                store.put(black_box(next), next);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_upsert_hot_keys, bench_get_hit, bench_insert_with_eviction);
criterion_main!(benches);
