//! Cache invalidation after writes
//!
//! [`Invalidator::after_write`] is the one supported ordering: run the write,
//! wait for it to be visible, then drop the cached reads that depended on it.
//! Invalidating first would let a concurrent reader re-cache the old value
//! before the write lands.

use crate::{error::CacheResult, store::CacheStore};
use std::{future::Future, sync::Arc};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct Invalidator {
    store: Arc<dyn CacheStore>,
}

impl Invalidator {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub async fn invalidate_tag(&self, tag: &str) -> CacheResult<usize> {
        self.store.invalidate_tag(tag).await
    }

    pub async fn invalidate_tags(&self, tags: &[String]) -> CacheResult<usize> {
        self.store.invalidate_tags(tags).await
    }

    pub async fn invalidate_pattern(&self, pattern: &str) -> CacheResult<usize> {
        self.store.delete_by_pattern(pattern).await
    }

    pub async fn delete(&self, key: &str) -> CacheResult<bool> {
        self.store.delete(key).await
    }

    /// Await `write`, then invalidate `tags` if it succeeded.
    ///
    /// `write` must resolve only once its effect is visible to readers. A
    /// failed write leaves the cache untouched and its error is returned
    /// unchanged. A failed invalidation is logged and does not turn a
    /// successful write into an error.
    pub async fn after_write<T, E, Fut>(&self, write: Fut, tags: &[String]) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let output = write.await?;
        self.invalidate_logged(tags).await;
        Ok(output)
    }

    /// Like [`after_write`](Self::after_write), with tags computed from the
    /// write's result (for example the id of a created row).
    pub async fn after_write_with<T, E, Fut, F>(&self, write: Fut, tags: F) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        F: FnOnce(&T) -> Vec<String>,
    {
        let output = write.await?;
        self.invalidate_logged(&tags(&output)).await;
        Ok(output)
    }

    async fn invalidate_logged(&self, tags: &[String]) {
        if tags.is_empty() {
            return;
        }

        match self.store.invalidate_tags(tags).await {
            Ok(removed) => debug!("Write invalidated {} entries for tags {:?}", removed, tags),
            Err(e) => warn!("Invalidation of tags {:?} failed after write: {}", tags, e),
        }
    }
}
