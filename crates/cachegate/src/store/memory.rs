//! In-memory cache store
//!
//! Entries live in a `DashMap` keyed by the namespaced key, tags in a second
//! `DashMap` (see [`TagIndex`]). Expired entries are removed lazily on access
//! and, when a sweep interval is configured, by a background task.

use super::{CacheStore, StoredValue, pattern::KeyPattern, tags::TagIndex};
use crate::{
    config::CacheConfig,
    error::{CacheError, CacheResult},
    scheduler::{Scheduler, SchedulerExt, TaskHandle},
    stats::{AtomicCacheMetrics, CacheStats},
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct Entry {
    value: Bytes,
    expires_at: Instant,
    tags: HashSet<String>,
    version: u64,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug)]
struct StoreInner {
    namespace: String,
    entries: DashMap<String, Entry>,
    tags: TagIndex,
    version: AtomicU64,
    metrics: AtomicCacheMetrics,
    scheduler: Arc<dyn Scheduler>,
}

impl StoreInner {
    fn full_key(&self, key: &str) -> String {
        format!("{}{key}", self.namespace)
    }

    fn logical_key<'a>(&self, full_key: &'a str) -> &'a str {
        full_key.strip_prefix(&self.namespace).unwrap_or(full_key)
    }

    /// Drop tag references for `full_key` that its live entry no longer carries.
    fn deindex<'a>(&self, full_key: &str, tags: impl IntoIterator<Item = &'a str>) {
        self.tags.prune(full_key, tags, |tag| {
            self.entries
                .get(full_key)
                .is_some_and(|entry| entry.tags.contains(tag))
        });
    }

    /// Remove `full_key` if `predicate` holds for its entry, keeping the tag
    /// index consistent.
    fn remove_where<F>(&self, full_key: &str, predicate: F) -> Option<Entry>
    where
        F: FnOnce(&Entry) -> bool,
    {
        let (_, removed) = self
            .entries
            .remove_if(full_key, |_, entry| predicate(entry))?;
        self.deindex(full_key, removed.tags.iter().map(String::as_str));
        Some(removed)
    }

    /// Remove `full_key` if `predicate` holds. Returns true when the removed
    /// entry was live; an expired one is counted as an expiration instead.
    fn evict<F>(&self, full_key: &str, now: Instant, predicate: F) -> bool
    where
        F: FnOnce(&Entry) -> bool,
    {
        match self.remove_where(full_key, predicate) {
            Some(entry) if entry.is_expired(now) => {
                self.metrics.record_expirations(1);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Look up a live entry, removing it when it has expired.
    fn live<T>(&self, full_key: &str, read: impl FnOnce(&Entry, Instant) -> T) -> Option<T> {
        let now = self.scheduler.now();
        {
            let entry = self.entries.get(full_key)?;
            if !entry.is_expired(now) {
                return Some(read(entry.value(), now));
            }
        }

        // The guard is released before removing
        if self
            .remove_where(full_key, |entry| entry.is_expired(now))
            .is_some()
        {
            self.metrics.record_expirations(1);
        }
        None
    }

    fn purge_expired(&self) -> usize {
        let now = self.scheduler.now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        let removed = expired
            .iter()
            .filter(|key| self.remove_where(key, |entry| entry.is_expired(now)).is_some())
            .count();

        if removed > 0 {
            self.metrics.record_expirations(removed);
            debug!("Swept {} expired cache entries", removed);
        }
        removed
    }
}

/// In-memory [`CacheStore`]
///
/// Cheap to share behind an `Arc`. Dropping the store stops its sweeper.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
    sweeper: Option<TaskHandle>,
}

impl MemoryStore {
    /// Create a store without a background sweeper; expired entries are
    /// removed when they are next accessed.
    pub fn new(config: &CacheConfig, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                namespace: config.namespace.clone(),
                entries: DashMap::new(),
                tags: TagIndex::new(),
                version: AtomicU64::new(0),
                metrics: AtomicCacheMetrics::new(),
                scheduler,
            }),
            sweeper: None,
        }
    }

    /// Create a store that also sweeps expired entries every
    /// `config.sweep_interval` (a zero interval disables the sweeper).
    pub fn with_sweeper(config: &CacheConfig, scheduler: Arc<dyn Scheduler>) -> Self {
        let mut store = Self::new(config, Arc::clone(&scheduler));
        if !config.sweep_interval.is_zero() {
            let inner = Arc::clone(&store.inner);
            store.sweeper = Some(scheduler.spawn_every(config.sweep_interval, move || {
                inner.purge_expired();
            }));
        }
        store
    }

    /// Remove expired entries now; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.inner.purge_expired()
    }

    /// The key prefix this store writes under.
    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Bytes>> {
        let value = self
            .inner
            .live(&self.inner.full_key(key), |entry, _| entry.value.clone());
        self.inner.metrics.record_get(value.is_some());
        Ok(value)
    }

    async fn get_with_ttl(&self, key: &str) -> CacheResult<Option<StoredValue>> {
        let value = self
            .inner
            .live(&self.inner.full_key(key), |entry, now| StoredValue {
                value: entry.value.clone(),
                ttl_remaining: entry.expires_at.saturating_duration_since(now),
            });
        self.inner.metrics.record_get(value.is_some());
        Ok(value)
    }

    async fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
        tags: &[String],
    ) -> CacheResult<()> {
        if ttl.is_zero() {
            self.inner.metrics.record_error();
            return Err(CacheError::InvalidTtl);
        }

        let inner = &self.inner;
        let full_key = inner.full_key(key);
        let entry = Entry {
            value,
            expires_at: inner.scheduler.now() + ttl,
            tags: tags.iter().cloned().collect(),
            version: inner.version.fetch_add(1, Ordering::SeqCst) + 1,
        };

        let previous = inner.entries.insert(full_key.clone(), entry);
        inner.tags.add(&full_key, tags);
        if let Some(previous) = previous {
            inner.deindex(&full_key, previous.tags.iter().map(String::as_str));
        }

        inner.metrics.record_set();
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let now = self.inner.scheduler.now();
        let removed = self.inner.evict(&self.inner.full_key(key), now, |_| true);
        if removed {
            self.inner.metrics.record_deletes(1);
        }
        Ok(removed)
    }

    async fn delete_by_pattern(&self, pattern: &str) -> CacheResult<usize> {
        let matcher = KeyPattern::compile(&self.inner.namespace, pattern)?;
        let matching: Vec<String> = self
            .inner
            .entries
            .iter()
            .filter(|entry| matcher.matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        let now = self.inner.scheduler.now();
        let removed = matching
            .iter()
            .filter(|key| self.inner.evict(key, now, |_| true))
            .count();

        self.inner.metrics.record_deletes(removed);
        debug!("Deleted {} keys matching '{}'", removed, pattern);
        Ok(removed)
    }

    async fn invalidate_tag(&self, tag: &str) -> CacheResult<usize> {
        let inner = &self.inner;
        let cutoff = inner.version.load(Ordering::SeqCst);
        let now = inner.scheduler.now();

        let mut removed = 0;
        for full_key in inner.tags.snapshot(tag) {
            let evicted = inner.evict(&full_key, now, |entry| {
                entry.version <= cutoff && entry.tags.contains(tag)
            });
            if evicted {
                removed += 1;
            } else {
                inner.deindex(&full_key, [tag]);
            }
        }

        inner.metrics.record_deletes(removed);
        debug!("Invalidated {} entries tagged '{}'", removed, tag);
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        Ok(self.inner.live(&self.inner.full_key(key), |_, _| ()).is_some())
    }

    async fn keys_for_tag(&self, tag: &str) -> CacheResult<Vec<String>> {
        let inner = &self.inner;
        let now = inner.scheduler.now();
        let mut keys = Vec::new();

        for full_key in inner.tags.snapshot(tag) {
            let live = inner
                .entries
                .get(&full_key)
                .is_some_and(|entry| entry.tags.contains(tag) && !entry.is_expired(now));
            if live {
                keys.push(inner.logical_key(&full_key).to_string());
            } else {
                inner.deindex(&full_key, [tag]);
            }
        }

        keys.sort_unstable();
        Ok(keys)
    }

    async fn flush(&self) -> CacheResult<usize> {
        let removed = self.inner.entries.len();
        self.inner.entries.clear();
        self.inner.tags.clear();
        self.inner.metrics.record_deletes(removed);
        debug!("Flushed {} cache entries", removed);
        Ok(removed)
    }

    async fn ping(&self) -> CacheResult<()> {
        Ok(())
    }

    fn len(&self) -> usize {
        self.inner.entries.len()
    }

    fn stats(&self) -> CacheStats {
        self.inner
            .metrics
            .snapshot(self.inner.entries.len(), self.inner.tags.len())
    }

    fn reset_stats(&self) {
        self.inner.metrics.reset();
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        // Cancel sweeper task
        if let Some(handle) = self.sweeper.take() {
            handle.abort();
        }
    }
}
