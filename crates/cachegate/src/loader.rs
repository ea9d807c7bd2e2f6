//! Key-batching loader
//!
//! [`BatchLoader`] collects individual `load(key)` calls and resolves them
//! with one call to a batch function. A batch is dispatched when it reaches
//! `max_batch_size` distinct keys or `batch_delay` after its first key was
//! queued, whichever comes first.
//!
//! - Duplicate keys, queued or already in flight, share one upstream result.
//! - The batch function returns one `Result` per key in key order; a per-key
//!   error fails only that key.
//! - With memoization enabled, resolved values are served for the lifetime
//!   of the loader without another batch.
//! - Dropping a `load` future before its batch is dispatched withdraws the
//!   key unless another caller still waits for it. Dispatched batches always
//!   run to completion.

use crate::{
    config::LoaderConfig,
    error::LoadError,
    scheduler::{Scheduler, SchedulerExt},
};
use futures::future::{BoxFuture, FutureExt, join_all};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    collections::HashMap,
    fmt,
    future::Future,
    hash::Hash,
    mem,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::sync::oneshot;
use tracing::{debug, warn};

type BatchFn<K, V, E> =
    Arc<dyn Fn(Vec<K>) -> BoxFuture<'static, Result<Vec<Result<V, E>>, E>> + Send + Sync>;
type LoadResult<V, E> = Result<V, LoadError<E>>;
type Waiter<V, E> = oneshot::Sender<LoadResult<V, E>>;

/// Loader counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoaderStats {
    /// `load` calls
    pub requests: u64,
    /// Calls answered from the memo
    pub memo_hits: u64,
    /// Batch function invocations
    pub batches: u64,
    /// Keys passed to the batch function
    pub keys_dispatched: u64,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    memo_hits: AtomicU64,
    batches: AtomicU64,
    keys_dispatched: AtomicU64,
}

struct LoaderState<K, V, E> {
    /// Distinct keys of the batch being collected
    queue: Vec<K>,
    /// Waiting callers for every queued or in-flight key
    waiters: HashMap<K, Vec<Waiter<V, E>>>,
    /// Generation of the batch being collected
    batch_id: u64,
    memo: HashMap<K, V>,
}

struct LoaderInner<K, V, E> {
    batch_fn: BatchFn<K, V, E>,
    config: LoaderConfig,
    scheduler: Arc<dyn Scheduler>,
    state: Mutex<LoaderState<K, V, E>>,
    counters: Counters,
}

/// Batches per-key lookups into calls of a batch function
pub struct BatchLoader<K, V, E> {
    inner: Arc<LoaderInner<K, V, E>>,
}

impl<K, V, E> Clone for BatchLoader<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V, E> fmt::Debug for BatchLoader<K, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchLoader")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl<K, V, E> BatchLoader<K, V, E>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn new<F, Fut>(batch_fn: F, config: LoaderConfig, scheduler: Arc<dyn Scheduler>) -> Self
    where
        F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Result<V, E>>, E>> + Send + 'static,
    {
        Self {
            inner: Arc::new(LoaderInner {
                batch_fn: Arc::new(move |keys| batch_fn(keys).boxed()),
                config,
                scheduler,
                state: Mutex::new(LoaderState {
                    queue: Vec::new(),
                    waiters: HashMap::new(),
                    batch_id: 0,
                    memo: HashMap::new(),
                }),
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.inner.config
    }

    /// Load one key through the next batch.
    pub async fn load(&self, key: K) -> LoadResult<V, E> {
        self.inner.counters.requests.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        let full_batch = {
            let mut state = self.inner.state.lock();
            if let Some(value) = state.memo.get(&key) {
                self.inner.counters.memo_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(value.clone());
            }

            if let Some(waiters) = state.waiters.get_mut(&key) {
                waiters.push(tx);
                None
            } else {
                state.waiters.insert(key.clone(), vec![tx]);
                state.queue.push(key.clone());
                if state.queue.len() == 1 {
                    self.schedule_flush(state.batch_id);
                }
                if state.queue.len() >= self.inner.config.max_batch_size {
                    Some(take_batch(&mut state))
                } else {
                    None
                }
            }
        };

        if let Some(keys) = full_batch {
            LoaderInner::dispatch(&self.inner, keys);
        }

        PendingLoad {
            loader: Arc::downgrade(&self.inner),
            key: Some(key),
            rx: Some(rx),
        }
        .wait()
        .await
    }

    /// Load several keys; they are queued together and share batches.
    pub async fn load_many<I>(&self, keys: I) -> Vec<LoadResult<V, E>>
    where
        I: IntoIterator<Item = K>,
    {
        join_all(keys.into_iter().map(|key| self.load(key))).await
    }

    /// Seed the memo with a known value. Existing entries are kept.
    pub fn prime(&self, key: K, value: V) {
        self.inner.state.lock().memo.entry(key).or_insert(value);
    }

    /// Forget the memoized value for `key`.
    pub fn clear(&self, key: &K) {
        self.inner.state.lock().memo.remove(key);
    }

    /// Forget every memoized value.
    pub fn clear_all(&self) {
        self.inner.state.lock().memo.clear();
    }

    pub fn stats(&self) -> LoaderStats {
        let counters = &self.inner.counters;
        LoaderStats {
            requests: counters.requests.load(Ordering::Relaxed),
            memo_hits: counters.memo_hits.load(Ordering::Relaxed),
            batches: counters.batches.load(Ordering::Relaxed),
            keys_dispatched: counters.keys_dispatched.load(Ordering::Relaxed),
        }
    }

    fn schedule_flush(&self, batch_id: u64) {
        let loader = Arc::downgrade(&self.inner);
        // Detached; a stale timer finds a newer batch_id and does nothing
        let _timer = self
            .inner
            .scheduler
            .spawn_after(self.inner.config.batch_delay, async move {
                if let Some(inner) = loader.upgrade() {
                    let keys = {
                        let mut state = inner.state.lock();
                        if state.batch_id != batch_id || state.queue.is_empty() {
                            return;
                        }
                        take_batch(&mut state)
                    };
                    LoaderInner::dispatch(&inner, keys);
                }
            });
    }
}

fn take_batch<K, V, E>(state: &mut LoaderState<K, V, E>) -> Vec<K> {
    state.batch_id += 1;
    mem::take(&mut state.queue)
}

impl<K, V, E> LoaderInner<K, V, E>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn dispatch(inner: &Arc<Self>, keys: Vec<K>) {
        debug!("Dispatching batch of {} keys", keys.len());
        inner.counters.batches.fetch_add(1, Ordering::Relaxed);
        inner
            .counters
            .keys_dispatched
            .fetch_add(keys.len() as u64, Ordering::Relaxed);

        let call = (inner.batch_fn)(keys.clone());
        let mut guard = DispatchGuard {
            inner: Arc::clone(inner),
            keys: Some(keys),
        };

        let _task = inner.scheduler.spawn(Box::pin(async move {
            let outcome = call.await;
            if let Some(keys) = guard.keys.take() {
                guard.inner.complete(keys, outcome);
            }
        }));
    }

    fn complete(&self, keys: Vec<K>, outcome: Result<Vec<Result<V, E>>, E>) {
        let expected = keys.len();
        let results: Vec<LoadResult<V, E>> = match outcome {
            Ok(values) if values.len() == expected => values
                .into_iter()
                .map(|result| result.map_err(LoadError::Key))
                .collect(),
            Ok(values) => {
                warn!(
                    "Batch function returned {} results for {} keys",
                    values.len(),
                    expected
                );
                let err = LoadError::ResultCount {
                    expected,
                    actual: values.len(),
                };
                vec![Err(err); expected]
            }
            Err(e) => vec![Err(LoadError::Batch(e)); expected],
        };

        self.resolve(keys, results);
    }

    fn resolve(&self, keys: Vec<K>, results: Vec<LoadResult<V, E>>) {
        let mut state = self.state.lock();
        for (key, result) in keys.into_iter().zip(results) {
            if self.config.memoize
                && let Ok(value) = &result
            {
                state.memo.insert(key.clone(), value.clone());
            }
            if let Some(waiters) = state.waiters.remove(&key) {
                for waiter in waiters {
                    // The caller may have gone away
                    let _ = waiter.send(result.clone());
                }
            }
        }
    }

    /// Withdraw `key` from the collecting batch if nobody waits for it.
    fn withdraw(&self, key: &K) {
        let mut state = self.state.lock();
        let Some(waiters) = state.waiters.get_mut(key) else {
            return;
        };
        waiters.retain(|waiter| !waiter.is_closed());
        if !waiters.is_empty() {
            return;
        }

        // In-flight keys keep their (empty) entry so later loads join the batch
        if let Some(position) = state.queue.iter().position(|queued| queued == key) {
            state.queue.remove(position);
            state.waiters.remove(key);
            if state.queue.is_empty() {
                // Disarm the pending timer; the next load starts a new batch
                state.batch_id += 1;
            }
        }
    }
}

/// Fails every key of a batch whose task ended without completing it.
struct DispatchGuard<K, V, E>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    inner: Arc<LoaderInner<K, V, E>>,
    keys: Option<Vec<K>>,
}

impl<K, V, E> Drop for DispatchGuard<K, V, E>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn drop(&mut self) {
        if let Some(keys) = self.keys.take() {
            warn!("Batch of {} keys ended without a result", keys.len());
            let results = vec![Err(LoadError::Dropped); keys.len()];
            self.inner.resolve(keys, results);
        }
    }
}

/// A caller waiting for its key; withdraws the key when dropped early.
struct PendingLoad<K, V, E>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    loader: Weak<LoaderInner<K, V, E>>,
    key: Option<K>,
    rx: Option<oneshot::Receiver<LoadResult<V, E>>>,
}

impl<K, V, E> PendingLoad<K, V, E>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    async fn wait(mut self) -> LoadResult<V, E> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(LoadError::Dropped);
        };
        let result = rx.await.unwrap_or(Err(LoadError::Dropped));
        self.key = None;
        result
    }
}

impl<K, V, E> Drop for PendingLoad<K, V, E>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn drop(&mut self) {
        // Close our receiver first so withdraw sees the sender as closed
        self.rx.take();
        if let (Some(key), Some(loader)) = (self.key.take(), self.loader.upgrade()) {
            loader.withdraw(&key);
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
#[allow(clippy::expect_used)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::scheduler::TokioScheduler;
    use std::time::Duration;

    type Calls = Arc<Mutex<Vec<Vec<u32>>>>;

    fn loader(config: LoaderConfig) -> (BatchLoader<u32, String, String>, Calls) {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&calls);
        let loader = BatchLoader::new(
            move |keys: Vec<u32>| {
                recorded.lock().push(keys.clone());
                async move {
                    Ok(keys
                        .into_iter()
                        .map(|k| {
                            if k == 13 {
                                Err(format!("user {k} not found"))
                            } else {
                                Ok(format!("user-{k}"))
                            }
                        })
                        .collect())
                }
            },
            config,
            TokioScheduler::shared(),
        );
        (loader, calls)
    }

    fn config() -> LoaderConfig {
        LoaderConfig::new()
            .with_max_batch_size(100)
            .with_batch_delay(Duration::from_millis(10))
    }

    #[tokio::test(start_paused = true)]
    async fn test_loads_are_batched_and_routed() {
        let (loader, calls) = loader(config());
        let (a, b, c) = tokio::join!(loader.load(1), loader.load(2), loader.load(3));

        assert_eq!(a, Ok("user-1".to_string()));
        assert_eq!(b, Ok("user-2".to_string()));
        assert_eq!(c, Ok("user-3".to_string()));
        assert_eq!(*calls.lock(), vec![vec![1, 2, 3]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_keys_share_result() {
        let (loader, calls) = loader(config());
        let results = loader.load_many([5, 5, 6, 5]).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(results[0], results[3]);
        assert_eq!(*calls.lock(), vec![vec![5, 6]]);
        assert_eq!(loader.stats().keys_dispatched, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_key_error_is_isolated() {
        let (loader, _) = loader(config());
        let results = loader.load_many([12, 13, 14]).await;

        assert_eq!(results[0], Ok("user-12".to_string()));
        assert_eq!(
            results[1],
            Err(LoadError::Key("user 13 not found".to_string()))
        );
        assert_eq!(results[2], Ok("user-14".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_error_fails_every_key() {
        let loader: BatchLoader<u32, u32, String> = BatchLoader::new(
            |_keys: Vec<u32>| async { Err("connection reset".to_string()) },
            config(),
            TokioScheduler::shared(),
        );
        let results = loader.load_many([1, 2]).await;
        for result in results {
            assert_eq!(result, Err(LoadError::Batch("connection reset".to_string())));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_result_count_fails_every_key() {
        let loader: BatchLoader<u32, u32, String> = BatchLoader::new(
            |_keys: Vec<u32>| async { Ok(vec![Ok(1)]) },
            config(),
            TokioScheduler::shared(),
        );
        let results = loader.load_many([1, 2, 3]).await;
        for result in results {
            assert_eq!(
                result,
                Err(LoadError::ResultCount {
                    expected: 3,
                    actual: 1
                })
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_batch_size_splits_batches() {
        let (loader, calls) = loader(config().with_max_batch_size(2));
        let results = loader.load_many([1, 2, 3, 4, 5]).await;

        assert_eq!(results.len(), 5);
        assert_eq!(*calls.lock(), vec![vec![1, 2], vec![3, 4], vec![5]]);
        assert_eq!(loader.stats().batches, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memoization_prime_and_clear() {
        let (loader, calls) = loader(config());
        assert_eq!(loader.load(1).await, Ok("user-1".to_string()));
        assert_eq!(loader.load(1).await, Ok("user-1".to_string()));
        assert_eq!(calls.lock().len(), 1);
        assert_eq!(loader.stats().memo_hits, 1);

        loader.prime(2, "primed".to_string());
        assert_eq!(loader.load(2).await, Ok("primed".to_string()));
        assert_eq!(calls.lock().len(), 1);

        loader.clear(&1);
        loader.load(1).await.expect("load");
        assert_eq!(calls.lock().len(), 2);

        loader.clear_all();
        loader.load(2).await.expect("load");
        assert_eq!(*calls.lock().last().expect("call"), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_memoization_every_load_batches() {
        let (loader, calls) = loader(config().with_memoize(false));
        loader.load(1).await.expect("load");
        loader.load(1).await.expect("load");
        assert_eq!(calls.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_load_is_withdrawn_before_dispatch() {
        let (loader, calls) = loader(config());

        let mut abandoned = Box::pin(loader.load(99));
        assert!(futures::poll!(abandoned.as_mut()).is_pending());
        drop(abandoned);

        assert_eq!(loader.load(1).await, Ok("user-1".to_string()));
        assert_eq!(*calls.lock(), vec![vec![1]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_duplicate_keeps_key_for_other_waiter() {
        let (loader, calls) = loader(config());

        let mut abandoned = Box::pin(loader.load(7));
        assert!(futures::poll!(abandoned.as_mut()).is_pending());
        let kept = loader.load(7);
        let mut kept = Box::pin(kept);
        assert!(futures::poll!(kept.as_mut()).is_pending());
        drop(abandoned);

        assert_eq!(kept.await, Ok("user-7".to_string()));
        assert_eq!(*calls.lock(), vec![vec![7]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emptied_batch_restarts_its_delay() {
        let (loader, calls) = loader(config());

        let mut abandoned = Box::pin(loader.load(99));
        assert!(futures::poll!(abandoned.as_mut()).is_pending());
        drop(abandoned);

        tokio::time::sleep(Duration::from_millis(6)).await;
        let mut next = Box::pin(loader.load(1));
        assert!(futures::poll!(next.as_mut()).is_pending());

        // The first batch's timer has fired by now; the new batch is not due
        tokio::time::sleep(Duration::from_millis(6)).await;
        assert!(calls.lock().is_empty());

        assert_eq!(next.await, Ok("user-1".to_string()));
        assert_eq!(*calls.lock(), vec![vec![1]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatched_batch_survives_dropped_load() {
        let runs = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let loader: BatchLoader<u32, u32, String> = BatchLoader::new(
            move |keys: Vec<u32>| {
                let counter = Arc::clone(&counter);
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(keys.into_iter().map(Ok).collect())
                }
            },
            config(),
            TokioScheduler::shared(),
        );

        let mut dropped = Box::pin(loader.load(1));
        assert!(futures::poll!(dropped.as_mut()).is_pending());
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(loader.stats().batches, 1);
        drop(dropped);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // The finished batch filled the memo
        assert_eq!(loader.load(1).await, Ok(1));
        let stats = loader.stats();
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.memo_hits, 1);
    }
}
