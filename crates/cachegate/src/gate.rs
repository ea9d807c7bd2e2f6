//! Bounded-concurrency gate for backing operations
//!
//! At most `max_concurrent` operations run at once. Callers beyond the limit
//! wait in FIFO order on tokio's fair semaphore; a caller still queued when
//! its deadline passes gets a [`PoolTimeout`] and its operation is never
//! started. The slot is released by [`GateGuard`] on success, error, panic or
//! cancellation alike.

#![allow(clippy::cast_precision_loss)] // Utilization is a ratio for reporting

use crate::{config::GateConfig, error::PoolTimeout};
use serde::Serialize;
use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct GateCounters {
    active: AtomicUsize,
    queued: AtomicUsize,
    peak_active: AtomicUsize,
    total_executed: AtomicU64,
    total_queued: AtomicU64,
    total_timeouts: AtomicU64,
}

/// Point-in-time gate statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GateStats {
    /// Operations currently holding a slot
    pub active: usize,
    /// Callers currently waiting for a slot
    pub queued: usize,
    /// Configured concurrency limit
    pub limit: usize,
    /// Operations admitted since the last reset
    pub total_executed: u64,
    /// Callers that had to wait since the last reset
    pub total_queued: u64,
    /// Callers that gave up waiting since the last reset
    pub total_timeouts: u64,
    /// Highest `active` value since the last reset
    pub peak_active: usize,
    /// `active / limit`
    pub utilization: f64,
}

/// RAII guard for an admitted operation
///
/// Frees the slot when dropped.
#[must_use = "GateGuard must be held for as long as the operation runs"]
#[derive(Debug)]
pub struct GateGuard {
    counters: Arc<GateCounters>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        // Runs before the permit field is released, so `active` never
        // exceeds the limit as seen by the next admitted caller
        self.counters.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Decrements the queue gauge however the wait ends
struct QueueTicket<'a> {
    counters: &'a GateCounters,
}

impl<'a> QueueTicket<'a> {
    fn enter(counters: &'a GateCounters) -> Self {
        counters.queued.fetch_add(1, Ordering::Relaxed);
        counters.total_queued.fetch_add(1, Ordering::Relaxed);
        Self { counters }
    }
}

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        self.counters.queued.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Concurrency limiter shared by cloning
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    counters: Arc<GateCounters>,
    config: GateConfig,
}

impl ConcurrencyGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            counters: Arc::new(GateCounters::default()),
            config,
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Wait up to `timeout` for a slot.
    pub async fn acquire(&self, timeout: Duration) -> Result<GateGuard, PoolTimeout> {
        let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits | TryAcquireError::Closed) => {
                let _ticket = QueueTicket::enter(&self.counters);
                debug!(
                    "Concurrency limit {} reached, queueing",
                    self.config.max_concurrent
                );

                let acquire = Arc::clone(&self.semaphore).acquire_owned();
                match tokio::time::timeout(timeout, acquire).await {
                    Ok(Ok(permit)) => permit,
                    // The semaphore is never closed; treat it like a missed deadline
                    Ok(Err(_)) | Err(_) => {
                        self.counters.total_timeouts.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "Gave up waiting for a concurrency slot after {:?} ({} active, {} queued)",
                            timeout,
                            self.counters.active.load(Ordering::Relaxed),
                            self.counters.queued.load(Ordering::Relaxed).saturating_sub(1)
                        );
                        return Err(PoolTimeout { waited: timeout });
                    }
                }
            }
        };

        let active = self.counters.active.fetch_add(1, Ordering::Relaxed) + 1;
        self.counters.peak_active.fetch_max(active, Ordering::Relaxed);
        self.counters.total_executed.fetch_add(1, Ordering::Relaxed);

        Ok(GateGuard {
            counters: Arc::clone(&self.counters),
            _permit: permit,
        })
    }

    /// Run `op` once a slot is free, waiting at most the configured timeout.
    pub async fn run<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        E: From<PoolTimeout>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_with_timeout(op, self.config.acquire_timeout).await
    }

    /// Run `op` once a slot is free, waiting at most `timeout`.
    ///
    /// The operation's own errors are returned unchanged; a missed deadline
    /// becomes `E::from(PoolTimeout)` and `op` is never called.
    pub async fn run_with_timeout<T, E, F, Fut>(&self, op: F, timeout: Duration) -> Result<T, E>
    where
        E: From<PoolTimeout>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _guard = self.acquire(timeout).await?;
        op().await
    }

    pub fn stats(&self) -> GateStats {
        let active = self.counters.active.load(Ordering::Relaxed);
        let limit = self.config.max_concurrent;

        GateStats {
            active,
            queued: self.counters.queued.load(Ordering::Relaxed),
            limit,
            total_executed: self.counters.total_executed.load(Ordering::Relaxed),
            total_queued: self.counters.total_queued.load(Ordering::Relaxed),
            total_timeouts: self.counters.total_timeouts.load(Ordering::Relaxed),
            peak_active: self.counters.peak_active.load(Ordering::Relaxed),
            utilization: if limit == 0 {
                0.0
            } else {
                active as f64 / limit as f64
            },
        }
    }

    /// Reset cumulative counters. Live gauges (`active`, `queued`) are kept.
    pub fn reset_stats(&self) {
        let counters = &self.counters;
        counters.total_executed.store(0, Ordering::Relaxed);
        counters.total_queued.store(0, Ordering::Relaxed);
        counters.total_timeouts.store(0, Ordering::Relaxed);
        counters
            .peak_active
            .store(counters.active.load(Ordering::Relaxed), Ordering::Relaxed);
    }
}
