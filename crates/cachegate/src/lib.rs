//! Tag-aware response caching and data-access guards
//!
//! `cachegate` sits between an application's read paths and its backing data
//! source (a database, an upstream API) and keeps that source from being
//! overwhelmed.
//!
//! # Features
//!
//! - **Cache store**: TTL-bounded byte values with tag and glob-pattern
//!   invalidation behind the [`CacheStore`] trait, with an in-memory
//!   implementation ([`MemoryStore`])
//! - **Typed facade**: [`Cache`] serializes values as JSON and coalesces
//!   concurrent misses on one key into a single fetch
//! - **Middleware**: [`Cache::wrap`] turns a read operation into a cached one
//!   with derived keys and tags; [`Cache::get_with_revalidate`] serves stale
//!   entries while refreshing them in the background
//! - **Invalidation**: [`Invalidator::after_write`] drops dependent entries
//!   once a write has landed
//! - **Concurrency gate**: [`ConcurrencyGate`] bounds in-flight backing
//!   operations with a FIFO queue and per-caller timeout
//! - **N+1 detection**: [`ShapeDetector`] counts normalized operation shapes
//!   per time window
//! - **Batching**: [`BatchLoader`] merges per-key loads into batch calls
//! - **Monitoring**: [`QueryMonitor`] records durations and flags slow calls;
//!   [`Diagnostics`] reports everything as one serializable snapshot
//!
//! Cache failures never fail a request: reads and writes against an
//! unavailable store are logged and the backing source is used directly.
//!
//! # Example
//!
//! ```rust,no_run
//! use cachegate::prelude::*;
//! use std::{sync::Arc, time::Duration};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LayerConfig::default();
//! let scheduler = TokioScheduler::shared();
//! let store: Arc<dyn CacheStore> =
//!     Arc::new(MemoryStore::new(&config.cache, Arc::clone(&scheduler)));
//! let cache = Cache::with_scheduler(Arc::clone(&store), config.cache.clone(), scheduler);
//!
//! let user: String = cache
//!     .get_or_set("user:1", Some(Duration::from_secs(60)), &["users".to_string()], || async {
//!         Ok::<_, String>("alice".to_string())
//!     })
//!     .await?;
//! assert_eq!(user, "alice");
//!
//! Invalidator::new(store)
//!     .after_write(async { Ok::<_, String>(()) }, &["users".to_string()])
//!     .await?;
//! # Ok(())
//! # }
//! ```
#![allow(clippy::return_self_not_must_use)] // Builder patterns
#![allow(clippy::doc_markdown)] // Cache-specific terms don't need backticks

pub mod access;
pub mod cache;
pub mod config;
pub mod detector;
pub mod diagnostics;
pub mod error;
pub mod flight;
pub mod gate;
pub mod invalidation;
pub mod key;
pub mod loader;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod middleware;
pub mod monitor;
pub mod scheduler;
pub mod stats;
pub mod store;

pub use access::DataAccess;
pub use cache::Cache;
pub use config::{CacheConfig, DetectorConfig, GateConfig, LayerConfig, LoaderConfig, MonitorConfig};
pub use detector::{ShapeDetector, ShapePattern};
pub use diagnostics::{Diagnostics, DiagnosticsReport};
pub use error::{CacheError, CacheResult, LoadError, PoolTimeout};
pub use flight::InFlight;
pub use gate::{ConcurrencyGate, GateGuard, GateStats};
pub use invalidation::Invalidator;
pub use key::{KeyBuilder, derive_key};
pub use loader::{BatchLoader, LoaderStats};
pub use middleware::{CacheStatus, Cached, CachedOperation, RevalidateOptions};
pub use monitor::{MonitorStats, OperationRecord, OperationStats, QueryMonitor};
pub use scheduler::{Scheduler, SchedulerExt, TaskHandle, TokioScheduler};
pub use stats::CacheStats;
pub use store::{CacheStore, KeyPattern, MemoryStore, StoredValue};

#[cfg(feature = "metrics")]
pub use metrics::PrometheusExporter;

pub mod prelude {
    //! Convenient re-exports of commonly used types and traits

    pub use crate::{
        BatchLoader, Cache, CacheError, CacheResult, CacheStatus, CacheStore, Cached,
        ConcurrencyGate, DataAccess, Diagnostics, Invalidator, LayerConfig, LoadError,
        MemoryStore, PoolTimeout, QueryMonitor, RevalidateOptions, Scheduler, SchedulerExt,
        ShapeDetector, TokioScheduler,
    };
}
