//! Typed cache facade
//!
//! [`Cache`] serializes values as JSON on top of any [`CacheStore`] and adds
//! [`get_or_set`](Cache::get_or_set), the read-through entry point used by
//! application code. Store failures never reach the caller of `get_or_set`:
//! they are logged and the fetch result is returned as if the cache were
//! absent.

use crate::{
    config::CacheConfig,
    error::{CacheError, CacheResult},
    flight::InFlight,
    scheduler::{Scheduler, TokioScheduler},
    store::CacheStore,
};
use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{debug, warn};

/// Typed, shareable handle to a cache store
#[derive(Debug, Clone)]
pub struct Cache {
    store: Arc<dyn CacheStore>,
    config: CacheConfig,
    flight: InFlight,
    refreshes: InFlight,
    scheduler: Arc<dyn Scheduler>,
}

impl Cache {
    /// Create a cache over `store`, scheduling background work on tokio.
    pub fn new(store: Arc<dyn CacheStore>, config: CacheConfig) -> Self {
        Self::with_scheduler(store, config, TokioScheduler::shared())
    }

    /// Create a cache with an explicit scheduler for background refreshes.
    pub fn with_scheduler(
        store: Arc<dyn CacheStore>,
        config: CacheConfig,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            store,
            config,
            flight: InFlight::new(),
            refreshes: InFlight::new(),
            scheduler,
        }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.flight
    }

    /// Registry of background stale-while-revalidate refreshes, kept apart
    /// from caller keys.
    pub(crate) fn refreshes(&self) -> &InFlight {
        &self.refreshes
    }

    pub(crate) fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// Read and deserialize a value.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        match self.store.get(key).await? {
            Some(raw) => decode(&raw).map(Some),
            None => Ok(None),
        }
    }

    /// Serialize and store a value; `ttl` defaults to the configured TTL.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        tags: &[String],
    ) -> CacheResult<()> {
        let raw = encode(value)?;
        self.store
            .set(key, raw, ttl.unwrap_or(self.config.default_ttl), tags)
            .await
    }

    pub async fn delete(&self, key: &str) -> CacheResult<bool> {
        self.store.delete(key).await
    }

    pub async fn exists(&self, key: &str) -> CacheResult<bool> {
        self.store.exists(key).await
    }

    /// Return the cached value for `key`, or run `fetch` and cache its result.
    ///
    /// Concurrent callers that miss on the same key share a single `fetch`;
    /// the shared call stores the value once and every caller receives a
    /// clone of the result. Fetch errors are returned to every waiter and are
    /// never cached.
    ///
    /// The shared call reads the store again before fetching, so a caller
    /// whose first read missed just before another call stored the value
    /// gets that value instead of fetching a second time.
    pub async fn get_or_set<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        tags: &[String],
        fetch: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        if let Some(value) = self.read_fail_open(key).await {
            return Ok(value);
        }

        let store = Arc::clone(&self.store);
        let owned_key = key.to_string();
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let tags = tags.to_vec();

        self.flight
            .run(key, move || {
                let pending = fetch();
                async move {
                    if let Some(value) = read_store_fail_open(store.as_ref(), &owned_key).await {
                        debug!("'{}' was filled while waiting, skipping fetch", owned_key);
                        return Ok(value);
                    }
                    let value = pending.await?;
                    write_fail_open(store.as_ref(), &owned_key, &value, ttl, &tags).await;
                    Ok(value)
                }
            })
            .await
    }

    /// Read that treats every store or decode failure as a miss.
    pub(crate) async fn read_fail_open<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        read_store_fail_open(self.store.as_ref(), key).await
    }
}

pub(crate) async fn read_store_fail_open<T: DeserializeOwned>(
    store: &dyn CacheStore,
    key: &str,
) -> Option<T> {
    let result = match store.get(key).await {
        Ok(Some(raw)) => decode(&raw).map(Some),
        Ok(None) => Ok(None),
        Err(e) => Err(e),
    };

    match result {
        Ok(value) => value,
        Err(e) => {
            warn!("Cache read for '{}' failed, bypassing cache: {}", key, e);
            None
        }
    }
}

pub(crate) fn encode<T: Serialize + ?Sized>(value: &T) -> CacheResult<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| CacheError::Serialization(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(raw: &[u8]) -> CacheResult<T> {
    serde_json::from_slice(raw).map_err(|e| CacheError::Deserialization(e.to_string()))
}

/// Store a fetched value; failures are logged and swallowed.
pub(crate) async fn write_fail_open<T: Serialize + ?Sized>(
    store: &dyn CacheStore,
    key: &str,
    value: &T,
    ttl: Duration,
    tags: &[String],
) {
    let result = match encode(value) {
        Ok(raw) => store.set(key, raw, ttl, tags).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => debug!("Cached '{}' for {:?}", key, ttl),
        Err(e) => warn!("Cache write for '{}' failed: {}", key, e),
    }
}
