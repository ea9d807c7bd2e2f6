//! Store and hot-path benchmarks.
//!
//! Run with:
//! ```bash
//! cargo bench --bench store
//! ```

#![allow(clippy::expect_used)]

use bytes::Bytes;
use cachegate::{
    CacheConfig, CacheStore, KeyPattern, MemoryStore, TokioScheduler, derive_key,
    detector::normalize,
};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::{hint::black_box, time::Duration};
use tokio::runtime::Runtime;

const MINUTE: Duration = Duration::from_secs(60);

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("Failed to build benchmark runtime")
}

fn seeded_store(rt: &Runtime, entries: usize) -> MemoryStore {
    let store = MemoryStore::new(&CacheConfig::default(), TokioScheduler::shared());
    rt.block_on(async {
        for i in 0..entries {
            let tags = vec![format!("user:{}", i % 100), "posts".to_string()];
            store
                .set(&format!("post:{i}"), Bytes::from_static(b"{\"title\":\"x\"}"), MINUTE, &tags)
                .await
                .expect("Failed to seed store");
        }
    });
    store
}

/// Benchmark single-key reads and writes.
fn bench_get_set(c: &mut Criterion) {
    let rt = runtime();
    let store = seeded_store(&rt, 10_000);
    let value = Bytes::from(vec![0u8; 256]);

    let mut group = c.benchmark_group("memory_store");

    group.bench_function("get_hit", |b| {
        b.iter(|| rt.block_on(store.get(black_box("post:42"))));
    });

    group.bench_function("get_miss", |b| {
        b.iter(|| rt.block_on(store.get(black_box("post:missing"))));
    });

    group.bench_function("set_tagged", |b| {
        let tags = vec!["bench".to_string()];
        b.iter(|| rt.block_on(store.set("bench:key", value.clone(), MINUTE, black_box(&tags))));
    });

    group.finish();
}

/// Benchmark tag invalidation against tag sets of different sizes.
fn bench_invalidate_tag(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("invalidate_tag");

    for size in [10usize, 100, 1_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || seeded_store(&rt, size),
                |store| rt.block_on(store.invalidate_tag("posts")),
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Benchmark the pure helpers on the request path.
fn bench_helpers(c: &mut Criterion) {
    let mut group = c.benchmark_group("helpers");

    group.bench_function("derive_key", |b| {
        let params = serde_json::json!({"author": 42, "page": 3, "sort": "recent"});
        b.iter(|| derive_key("posts.list", black_box(&params)));
    });

    group.bench_function("normalize", |b| {
        b.iter(|| {
            normalize(black_box(
                "SELECT * FROM comments WHERE post_id IN (1, 2, 3, 4) AND author = 'bob'",
            ))
        });
    });

    group.bench_function("pattern_match", |b| {
        let pattern = KeyPattern::compile("cache:", "user:*:posts").expect("valid pattern");
        b.iter(|| pattern.matches(black_box("cache:user:42:posts")));
    });

    group.finish();
}

criterion_group!(benches, bench_get_set, bench_invalidate_tag, bench_helpers);
criterion_main!(benches);
