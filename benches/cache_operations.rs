//! Benchmarks for the L1 tiered memory store.

use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::hint::black_box;
use strata_cache::config::L1Config;
use strata_cache::L1Cache;

fn bench_l1_operations(c: &mut Criterion) {
    let cache = L1Cache::new(&L1Config::default());

    c.bench_function("l1_set", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            cache.set(&format!("bench:set:{}", i % 10_000), json!({"v": i}), None);
        });
    });

    cache.set("bench:hot", json!({"user": "alice", "score": 100}), None);
    c.bench_function("l1_get_hit", |b| {
        b.iter(|| black_box(cache.get("bench:hot")));
    });

    c.bench_function("l1_get_miss", |b| {
        b.iter(|| black_box(cache.get("bench:absent")));
    });
}

fn bench_l1_invalidation(c: &mut Criterion) {
    use strata_cache::KeyPattern;

    c.bench_function("l1_pattern_invalidation_1k", |b| {
        b.iter_batched(
            || {
                let cache = L1Cache::new(&L1Config::default());
                for i in 0..1_000 {
                    cache.set(&format!("user:{i}"), json!(i), None);
                }
                cache
            },
            |cache| {
                let pattern = KeyPattern::compile("user:9*");
                black_box(cache.invalidate_pattern(&pattern))
            },
            criterion::BatchSize::LargeInput,
        );
    });
}

criterion_group!(benches, bench_l1_operations, bench_l1_invalidation);
criterion_main!(benches);
