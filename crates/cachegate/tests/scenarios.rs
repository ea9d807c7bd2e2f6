//! End-to-end scenarios across the cache, gate, loader and diagnostics.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use cachegate::{
    BatchLoader, Cache, CacheConfig, CacheStatus, CacheStore, ConcurrencyGate, DataAccess,
    Diagnostics, GateConfig, Invalidator, LayerConfig, LoadError, LoaderConfig, MemoryStore,
    PoolTimeout, RevalidateOptions, TokioScheduler,
};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::Barrier;

fn tags(names: &[&str]) -> Vec<String> {
    names.iter().map(ToString::to_string).collect()
}

fn layer() -> (Arc<dyn CacheStore>, Cache) {
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new(
        &CacheConfig::default(),
        TokioScheduler::shared(),
    ));
    let cache = Cache::new(Arc::clone(&store), CacheConfig::default());
    (store, cache)
}

#[tokio::test(start_paused = true)]
async fn expiry_then_tag_invalidation() {
    let (store, cache) = layer();

    cache
        .set("a", &json!({"x": 1}), Some(Duration::from_secs(2)), &tags(&["g"]))
        .await
        .expect("set a");
    assert_eq!(
        cache.get::<Value>("a").await.expect("get a"),
        Some(json!({"x": 1}))
    );

    tokio::time::advance(Duration::from_secs(3)).await;
    assert_eq!(cache.get::<Value>("a").await.expect("get a"), None);

    cache
        .set("b", &json!({"x": 2}), Some(Duration::from_secs(100)), &tags(&["g"]))
        .await
        .expect("set b");
    let removed = store.invalidate_tags(&tags(&["g"])).await.expect("invalidate");
    assert_eq!(removed, 1);
    assert_eq!(cache.get::<Value>("b").await.expect("get b"), None);
}

#[tokio::test]
async fn set_after_write_invalidation_survives() {
    let (store, cache) = layer();
    let invalidator = Invalidator::new(Arc::clone(&store));

    cache
        .set("user:1", &json!({"name": "old"}), None, &tags(&["users"]))
        .await
        .expect("set");

    invalidator
        .after_write(async { Ok::<_, String>(()) }, &tags(&["users"]))
        .await
        .expect("write");
    cache
        .set("user:1", &json!({"name": "new"}), None, &tags(&["users"]))
        .await
        .expect("set");

    assert_eq!(
        cache.get::<Value>("user:1").await.expect("get"),
        Some(json!({"name": "new"}))
    );
    assert_eq!(store.keys_for_tag("users").await.expect("keys"), vec!["user:1"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_misses_fetch_once() {
    let (_, cache) = layer();
    let fetches = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(32));

    let mut handles = Vec::new();
    for _ in 0..32 {
        let cache = cache.clone();
        let fetches = Arc::clone(&fetches);
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            cache
                .get_or_set("report:daily", None, &tags(&["reports"]), || async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, String>(vec![1u32, 2, 3])
                })
                .await
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.expect("join"), Ok(vec![1, 2, 3]));
    }
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    assert_eq!(
        cache.get::<Vec<u32>>("report:daily").await.expect("get"),
        Some(vec![1, 2, 3])
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn gate_bounds_parallel_work_and_serves_everyone() {
    let gate = ConcurrencyGate::new(
        GateConfig::new()
            .with_max_concurrent(3)
            .with_acquire_timeout(Duration::from_secs(10)),
    );
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..30 {
        let gate = gate.clone();
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        handles.push(tokio::spawn(async move {
            gate.run(|| async {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, PoolTimeout>(i)
            })
            .await
        }));
    }

    let mut finished = Vec::new();
    for handle in handles {
        finished.push(handle.await.expect("join").expect("admitted"));
    }
    finished.sort_unstable();
    assert_eq!(finished, (0..30).collect::<Vec<_>>());
    assert!(peak.load(Ordering::SeqCst) <= 3);

    let stats = gate.stats();
    assert_eq!(stats.total_executed, 30);
    assert_eq!(stats.total_timeouts, 0);
    assert_eq!(stats.active, 0);
    assert!(stats.peak_active <= 3);
}

#[derive(Debug, Clone, PartialEq)]
enum DbError {
    Busy,
    Missing(u64),
}

impl From<PoolTimeout> for DbError {
    fn from(_: PoolTimeout) -> Self {
        Self::Busy
    }
}

#[tokio::test(start_paused = true)]
async fn batched_lookups_through_data_access() {
    let config = LayerConfig::default();
    let scheduler = TokioScheduler::shared();
    let access = DataAccess::new(&config, Arc::clone(&scheduler));

    let batch_access = access.clone();
    let loader: BatchLoader<u64, String, DbError> = BatchLoader::new(
        move |ids: Vec<u64>| {
            let access = batch_access.clone();
            async move {
                let list = ids
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                access
                    .run(&format!("SELECT * FROM users WHERE id IN ({list})"), || async {
                        Ok::<Vec<Result<String, DbError>>, DbError>(ids
                            .iter()
                            .map(|&id| {
                                if id == 404 {
                                    Err(DbError::Missing(id))
                                } else {
                                    Ok(format!("user-{id}"))
                                }
                            })
                            .collect())
                    })
                    .await
            }
        },
        LoaderConfig::new().with_batch_delay(Duration::from_millis(5)),
        scheduler,
    );

    let results = loader.load_many([3, 1, 404, 3, 2, 1]).await;
    assert_eq!(
        results,
        vec![
            Ok("user-3".to_string()),
            Ok("user-1".to_string()),
            Err(LoadError::Key(DbError::Missing(404))),
            Ok("user-3".to_string()),
            Ok("user-2".to_string()),
            Ok("user-1".to_string()),
        ]
    );

    let stats = loader.stats();
    assert_eq!(stats.batches, 1);
    assert_eq!(stats.keys_dispatched, 4);

    let monitor = access.monitor().stats();
    assert_eq!(monitor.total_operations, 1);
    assert_eq!(
        monitor.per_operation[0].name,
        "select * from users where id in (?)"
    );
}

#[tokio::test(start_paused = true)]
async fn stale_feed_is_refreshed_then_invalidated() {
    let (store, cache) = layer();
    let version = Arc::new(AtomicUsize::new(0));
    let options = RevalidateOptions::new(Duration::from_secs(60), Duration::from_secs(10))
        .with_tags(["feed"]);

    let read = |cache: &Cache| {
        let cache = cache.clone();
        let version = Arc::clone(&version);
        let options = options.clone();
        async move {
            cache
                .get_with_revalidate(
                    "feed:home",
                    move || async move {
                        let n = version.fetch_add(1, Ordering::SeqCst) + 1;
                        Ok::<_, String>(format!("feed v{n}"))
                    },
                    options,
                )
                .await
                .expect("read")
        }
    };

    let first = read(&cache).await;
    assert_eq!(first.status, CacheStatus::Miss);

    tokio::time::advance(Duration::from_secs(20)).await;
    let stale = read(&cache).await;
    assert_eq!(stale.status, CacheStatus::Stale);
    assert_eq!(stale.value, "feed v1");

    tokio::time::sleep(Duration::from_millis(1)).await;
    let refreshed = read(&cache).await;
    assert_eq!(refreshed.status, CacheStatus::Hit);
    assert_eq!(refreshed.value, "feed v2");

    Invalidator::new(Arc::clone(&store))
        .after_write(async { Ok::<_, String>(()) }, &tags(&["feed"]))
        .await
        .expect("write");
    let after_write = read(&cache).await;
    assert_eq!(after_write.status, CacheStatus::Miss);
    assert_eq!(after_write.value, "feed v3");
}

#[tokio::test]
async fn diagnostics_report_serializes() {
    let config = LayerConfig::default();
    let scheduler = TokioScheduler::shared();
    let store: Arc<dyn CacheStore> =
        Arc::new(MemoryStore::new(&config.cache, Arc::clone(&scheduler)));
    let cache = Cache::new(Arc::clone(&store), config.cache.clone());
    let diagnostics = Diagnostics::new(store, DataAccess::new(&config, scheduler));

    cache.set("k", &1u8, None, &[]).await.expect("set");
    cache.get::<u8>("k").await.expect("get");

    let json = serde_json::to_value(diagnostics.report()).expect("serialize");
    assert_eq!(json["cache"]["hits"], 1);
    assert_eq!(json["cache"]["entries"], 1);
    assert_eq!(json["gate"]["limit"], 10);
    assert_eq!(json["hot_shapes"], json!([]));
}
