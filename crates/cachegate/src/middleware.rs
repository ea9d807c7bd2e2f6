//! Read-through caching for whole operations
//!
//! Two entry points sit on top of [`Cache`]:
//!
//! - [`Cache::wrap`] turns an async read operation into a
//!   [`CachedOperation`] whose results are cached under a key derived from
//!   the operation name and its parameters.
//! - [`Cache::get_with_revalidate`] serves possibly stale values immediately
//!   and refreshes them in the background (stale-while-revalidate).
//!
//! Only read operations should be wrapped. Writes go through
//! [`Invalidator`](crate::invalidation::Invalidator).

use crate::{
    cache::{Cache, decode, read_store_fail_open, write_fail_open},
    key::derive_key,
};
use futures::future::{BoxFuture, FutureExt};
use serde::{Serialize, de::DeserializeOwned};
use std::{fmt, future::Future, sync::Arc, time::Duration};
use tracing::{debug, warn};

/// How a value was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    /// Served from the cache
    Hit,
    /// Served from the cache past its freshness window; a refresh was started
    Stale,
    /// Produced by the operation and written to the cache
    Miss,
    /// Produced by the operation without consulting the cache
    Bypass,
}

/// A value together with its [`CacheStatus`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cached<T> {
    pub value: T,
    pub status: CacheStatus,
}

impl<T> Cached<T> {
    pub fn new(value: T, status: CacheStatus) -> Self {
        Self { value, status }
    }

    pub fn is_hit(&self) -> bool {
        self.status == CacheStatus::Hit
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

type Operation<P, T, E> = Arc<dyn Fn(P) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;
type ParamsFn<P, R> = Arc<dyn Fn(&P) -> R + Send + Sync>;
type ValueFn<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// A read operation with caching applied
///
/// Built with [`Cache::wrap`] and configured with the builder methods below.
pub struct CachedOperation<P, T, E> {
    cache: Cache,
    name: String,
    operation: Operation<P, T, E>,
    ttl: Option<Duration>,
    tags: Vec<String>,
    tags_with: Option<ParamsFn<P, Vec<String>>>,
    key_with: Option<ParamsFn<P, String>>,
    should_cache: Option<ValueFn<T>>,
    skip_when: Option<ParamsFn<P, bool>>,
}

impl<P, T, E> Clone for CachedOperation<P, T, E> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            name: self.name.clone(),
            operation: Arc::clone(&self.operation),
            ttl: self.ttl,
            tags: self.tags.clone(),
            tags_with: self.tags_with.clone(),
            key_with: self.key_with.clone(),
            should_cache: self.should_cache.clone(),
            skip_when: self.skip_when.clone(),
        }
    }
}

impl<P, T, E> fmt::Debug for CachedOperation<P, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedOperation")
            .field("name", &self.name)
            .field("ttl", &self.ttl)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

impl Cache {
    /// Wrap a read operation named `name` with caching.
    pub fn wrap<P, T, E, Op, Fut>(
        &self,
        name: impl Into<String>,
        operation: Op,
    ) -> CachedOperation<P, T, E>
    where
        Op: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        CachedOperation {
            cache: self.clone(),
            name: name.into(),
            operation: Arc::new(move |params| operation(params).boxed()),
            ttl: None,
            tags: Vec::new(),
            tags_with: None,
            key_with: None,
            should_cache: None,
            skip_when: None,
        }
    }
}

impl<P, T, E> CachedOperation<P, T, E>
where
    P: Serialize,
    T: Serialize + DeserializeOwned,
{
    /// Cache results for `ttl` instead of the cache's default TTL.
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Tag every cached result with `tags`.
    #[must_use]
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Add tags computed from the call parameters.
    #[must_use]
    pub fn tags_with<F>(mut self, tags: F) -> Self
    where
        F: Fn(&P) -> Vec<String> + Send + Sync + 'static,
    {
        self.tags_with = Some(Arc::new(tags));
        self
    }

    /// Replace the default parameter-digest key.
    #[must_use]
    pub fn key_with<F>(mut self, key: F) -> Self
    where
        F: Fn(&P) -> String + Send + Sync + 'static,
    {
        self.key_with = Some(Arc::new(key));
        self
    }

    /// Only cache results for which `predicate` returns true.
    #[must_use]
    pub fn should_cache<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.should_cache = Some(Arc::new(predicate));
        self
    }

    /// Skip the cache entirely for calls where `predicate` returns true.
    #[must_use]
    pub fn skip_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&P) -> bool + Send + Sync + 'static,
    {
        self.skip_when = Some(Arc::new(predicate));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The cache key a call with `params` would use.
    pub fn key_for(&self, params: &P) -> Option<String> {
        if let Some(key_with) = &self.key_with {
            return Some(key_with(params));
        }

        match derive_key(&self.name, params) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!("Cannot derive cache key for '{}': {}", self.name, e);
                None
            }
        }
    }

    /// Run the operation, serving and populating the cache.
    ///
    /// Operation errors are returned unchanged and never cached.
    pub async fn call(&self, params: P) -> Result<Cached<T>, E> {
        let skip = self.skip_when.as_ref().is_some_and(|skip| skip(&params));
        let key = if skip { None } else { self.key_for(&params) };

        let Some(key) = key else {
            let value = (self.operation)(params).await?;
            return Ok(Cached::new(value, CacheStatus::Bypass));
        };

        if let Some(value) = self.cache.read_fail_open::<T>(&key).await {
            debug!("Cache hit for '{}' ({})", self.name, key);
            return Ok(Cached::new(value, CacheStatus::Hit));
        }

        let mut tags = self.tags.clone();
        if let Some(tags_with) = &self.tags_with {
            tags.extend(tags_with(&params));
        }

        let value = (self.operation)(params).await?;

        if self.should_cache.as_ref().is_none_or(|keep| keep(&value)) {
            let ttl = self.ttl.unwrap_or(self.cache.config().default_ttl);
            write_fail_open(self.cache.store().as_ref(), &key, &value, ttl, &tags).await;
        } else {
            debug!("Result of '{}' rejected by should_cache", self.name);
        }

        Ok(Cached::new(value, CacheStatus::Miss))
    }
}

/// Freshness settings for [`Cache::get_with_revalidate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevalidateOptions {
    /// Hard lifetime of the cached entry
    pub ttl: Duration,
    /// Age after which an entry is served stale and refreshed
    pub stale_time: Duration,
    /// Tags attached to the stored entry
    pub tags: Vec<String>,
}

impl RevalidateOptions {
    pub fn new(ttl: Duration, stale_time: Duration) -> Self {
        Self {
            ttl,
            stale_time,
            tags: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

impl Cache {
    /// Stale-while-revalidate read.
    ///
    /// - Entry younger than `stale_time`: returned as [`CacheStatus::Hit`].
    /// - Entry older than `stale_time` but within `ttl`: returned at once as
    ///   [`CacheStatus::Stale`] while `fetch` refreshes it in the background.
    ///   At most one refresh per key runs at a time; a failed refresh is
    ///   logged and the stale entry is kept.
    /// - No entry: `fetch` runs (coalesced per key) and its value is cached.
    ///
    /// Entry age is derived from the remaining TTL, so entries under `key`
    /// must be written with the same `ttl`.
    pub async fn get_with_revalidate<T, E, F, Fut>(
        &self,
        key: &str,
        fetch: F,
        options: RevalidateOptions,
    ) -> Result<Cached<T>, E>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + fmt::Display + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let stored = match self.store().get_with_ttl(key).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Cache read for '{}' failed, bypassing cache: {}", key, e);
                None
            }
        };

        if let Some(stored) = stored {
            match decode::<T>(&stored.value) {
                Ok(value) => {
                    let age = options.ttl.saturating_sub(stored.ttl_remaining);
                    if age < options.stale_time {
                        return Ok(Cached::new(value, CacheStatus::Hit));
                    }
                    self.spawn_refresh(key, fetch, options);
                    return Ok(Cached::new(value, CacheStatus::Stale));
                }
                Err(e) => warn!("Cached value for '{}' is unreadable, refetching: {}", key, e),
            }
        }

        let store = Arc::clone(self.store());
        let owned_key = key.to_string();
        let value = self
            .in_flight()
            .run(key, move || {
                let pending = fetch();
                async move {
                    if let Some(value) = read_store_fail_open(store.as_ref(), &owned_key).await {
                        return Ok::<T, E>(value);
                    }
                    let value = pending.await?;
                    write_fail_open(
                        store.as_ref(),
                        &owned_key,
                        &value,
                        options.ttl,
                        &options.tags,
                    )
                    .await;
                    Ok(value)
                }
            })
            .await?;

        Ok(Cached::new(value, CacheStatus::Miss))
    }

    fn spawn_refresh<T, E, F, Fut>(&self, key: &str, fetch: F, options: RevalidateOptions)
    where
        T: Serialize + Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + fmt::Display + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let store = Arc::clone(self.store());
        let owned_key = key.to_string();

        let Some(refresh) = self.refreshes().try_start(key, move || async move {
            let value = fetch().await?;
            write_fail_open(store.as_ref(), &owned_key, &value, options.ttl, &options.tags).await;
            Ok::<T, E>(value)
        }) else {
            debug!("Refresh for '{}' already running", key);
            return;
        };

        let key = key.to_string();
        // Detached; the task ends on its own once the refresh settles
        let _task = self.scheduler().spawn(Box::pin(async move {
            match refresh.await {
                Ok(_) => debug!("Refreshed stale entry '{}'", key),
                Err(e) => warn!(
                    "Background refresh for '{}' failed, keeping stale entry: {}",
                    key, e
                ),
            }
        }));
    }
}
