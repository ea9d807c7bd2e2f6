//! Key-value cache store with TTL, tags and pattern deletion
//!
//! [`CacheStore`] is the backend seam. Everything above it (the typed
//! [`Cache`](crate::cache::Cache), the middleware, the invalidator) talks to
//! an `Arc<dyn CacheStore>`, so a networked key-value backend can replace
//! [`MemoryStore`] without touching callers.
//!
//! Keys passed to a store are logical keys; the store applies its namespace
//! prefix internally.

mod memory;
mod pattern;
mod tags;

pub use memory::MemoryStore;
pub use pattern::KeyPattern;

use crate::{error::CacheResult, stats::CacheStats};
use async_trait::async_trait;
use bytes::Bytes;
use std::{fmt, time::Duration};

/// A value read together with its remaining lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    /// Serialized value
    pub value: Bytes,
    /// Time left before the entry expires
    pub ttl_remaining: Duration,
}

/// Core async store trait
#[async_trait]
pub trait CacheStore: Send + Sync + fmt::Debug {
    /// Returns `None` for absent or expired keys.
    async fn get(&self, key: &str) -> CacheResult<Option<Bytes>>;

    /// Like [`get`](Self::get), plus the remaining TTL.
    async fn get_with_ttl(&self, key: &str) -> CacheResult<Option<StoredValue>>;

    /// Store `value` for `ttl`, replacing any previous value and tags.
    ///
    /// A zero TTL is rejected with [`CacheError::InvalidTtl`](crate::error::CacheError::InvalidTtl).
    async fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
        tags: &[String],
    ) -> CacheResult<()>;

    /// Returns true if a live entry was removed.
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Remove every key matching a glob; returns the number removed.
    async fn delete_by_pattern(&self, pattern: &str) -> CacheResult<usize>;

    /// Remove every entry carrying `tag`.
    ///
    /// Only entries written before the call started are removed; a `set`
    /// issued after it returns always survives.
    async fn invalidate_tag(&self, tag: &str) -> CacheResult<usize>;

    /// Invalidate several tags. A key carrying more than one of them is
    /// counted once.
    async fn invalidate_tags(&self, tags: &[String]) -> CacheResult<usize> {
        let mut removed = 0;
        for tag in tags {
            removed += self.invalidate_tag(tag).await?;
        }
        Ok(removed)
    }

    /// Returns false for expired entries.
    async fn exists(&self, key: &str) -> CacheResult<bool>;

    /// Live keys carrying `tag`.
    async fn keys_for_tag(&self, tag: &str) -> CacheResult<Vec<String>>;

    /// Remove every entry in the namespace; returns the number removed.
    async fn flush(&self) -> CacheResult<usize>;

    /// Check that the backend is reachable.
    async fn ping(&self) -> CacheResult<()>;

    /// Entry count, possibly including entries not yet swept.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stats(&self) -> CacheStats;

    fn reset_stats(&self);
}
