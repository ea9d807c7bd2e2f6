//! Diagnostics and admin surface
//!
//! [`Diagnostics`] gathers one serializable snapshot of the whole layer and
//! exposes the admin operations an operator needs. Exposing it over a
//! transport is left to the embedding application.

use crate::{
    access::DataAccess,
    detector::ShapePattern,
    error::CacheResult,
    gate::GateStats,
    invalidation::Invalidator,
    monitor::MonitorStats,
    stats::CacheStats,
    store::CacheStore,
};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::info;

/// Snapshot of every component's statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticsReport {
    pub cache: CacheStats,
    pub gate: GateStats,
    pub monitor: MonitorStats,
    /// Shapes above the detector's configured threshold
    pub hot_shapes: Vec<ShapePattern>,
}

#[derive(Debug, Clone)]
pub struct Diagnostics {
    store: Arc<dyn CacheStore>,
    access: DataAccess,
    invalidator: Invalidator,
}

impl Diagnostics {
    pub fn new(store: Arc<dyn CacheStore>, access: DataAccess) -> Self {
        Self {
            invalidator: Invalidator::new(Arc::clone(&store)),
            store,
            access,
        }
    }

    pub fn report(&self) -> DiagnosticsReport {
        DiagnosticsReport {
            cache: self.store.stats(),
            gate: self.access.gate().stats(),
            monitor: self.access.monitor().stats(),
            hot_shapes: self.access.detector().hot_patterns(),
        }
    }

    /// Remove every cache entry in the namespace.
    pub async fn flush_all(&self) -> CacheResult<usize> {
        let removed = self.store.flush().await?;
        info!("Flushed {} cache entries", removed);
        Ok(removed)
    }

    pub async fn invalidate_tags(&self, tags: &[String]) -> CacheResult<usize> {
        let removed = self.invalidator.invalidate_tags(tags).await?;
        info!("Invalidated {} entries for tags {:?}", removed, tags);
        Ok(removed)
    }

    pub async fn invalidate_pattern(&self, pattern: &str) -> CacheResult<usize> {
        let removed = self.invalidator.invalidate_pattern(pattern).await?;
        info!("Invalidated {} entries matching '{}'", removed, pattern);
        Ok(removed)
    }

    /// Reset cumulative statistics of every component.
    pub fn reset_stats(&self) {
        self.store.reset_stats();
        self.access.gate().reset_stats();
        self.access.monitor().reset();
        self.access.detector().reset();
    }

    /// Round-trip time of a store health check.
    pub async fn ping(&self) -> CacheResult<Duration> {
        let start = Instant::now();
        self.store.ping().await?;
        Ok(start.elapsed())
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
#[allow(clippy::expect_used)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{
        config::{DetectorConfig, LayerConfig},
        error::PoolTimeout,
        scheduler::TokioScheduler,
        store::MemoryStore,
    };
    use bytes::Bytes;

    const MINUTE: Duration = Duration::from_secs(60);

    fn diagnostics() -> (Arc<dyn CacheStore>, Diagnostics) {
        let config = LayerConfig {
            detector: DetectorConfig::new().with_threshold(1),
            ..LayerConfig::default()
        };
        let scheduler = TokioScheduler::shared();
        let store: Arc<dyn CacheStore> =
            Arc::new(MemoryStore::new(&config.cache, Arc::clone(&scheduler)));
        let access = DataAccess::new(&config, scheduler);
        (Arc::clone(&store), Diagnostics::new(store, access))
    }

    async fn seed(store: &Arc<dyn CacheStore>) {
        for (key, tag) in [("posts:1", "posts"), ("posts:2", "posts"), ("users:1", "users")] {
            store
                .set(key, Bytes::from_static(b"{}"), MINUTE, &[tag.to_string()])
                .await
                .expect("set");
        }
    }

    #[tokio::test]
    async fn test_report_collects_every_component() {
        let (store, diagnostics) = diagnostics();
        seed(&store).await;
        store.get("posts:1").await.expect("get");

        for _ in 0..3 {
            diagnostics
                .access
                .run("SELECT * FROM tags WHERE post_id = 1", || async {
                    Ok::<_, PoolTimeout>(())
                })
                .await
                .expect("run");
        }

        let report = diagnostics.report();
        assert_eq!(report.cache.entries, 3);
        assert_eq!(report.cache.hits, 1);
        assert_eq!(report.gate.total_executed, 3);
        assert_eq!(report.monitor.total_operations, 3);
        assert_eq!(report.hot_shapes.len(), 1);

        let json = serde_json::to_value(&report).expect("serialize");
        assert_eq!(json["hot_shapes"][0]["count"], 3);
        assert_eq!(json["cache"]["entries"], 3);
    }

    #[tokio::test]
    async fn test_admin_operations() {
        let (store, diagnostics) = diagnostics();
        seed(&store).await;

        assert_eq!(
            diagnostics
                .invalidate_tags(&["posts".to_string()])
                .await
                .expect("tags"),
            2
        );
        assert_eq!(diagnostics.invalidate_pattern("users:*").await.expect("pattern"), 1);

        seed(&store).await;
        assert_eq!(diagnostics.flush_all().await.expect("flush"), 3);
        assert!(diagnostics.ping().await.is_ok());

        diagnostics.reset_stats();
        let report = diagnostics.report();
        assert_eq!(report.cache.sets, 0);
        assert_eq!(report.cache.deletes, 0);
        assert_eq!(report.monitor, MonitorStats::default());
    }
}
