//! Observed, bounded backing operations
//!
//! [`DataAccess`] bundles the three guards every backing call should pass
//! through: the shape detector sees the call, the concurrency gate admits
//! it, and the monitor records how long it ran.

use crate::{
    config::LayerConfig,
    detector::{ShapeDetector, normalize},
    error::PoolTimeout,
    gate::ConcurrencyGate,
    monitor::QueryMonitor,
    scheduler::Scheduler,
};
use std::{future::Future, sync::Arc};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct DataAccess {
    gate: ConcurrencyGate,
    monitor: QueryMonitor,
    detector: ShapeDetector,
}

impl DataAccess {
    pub fn new(config: &LayerConfig, scheduler: Arc<dyn Scheduler>) -> Self {
        Self::from_parts(
            ConcurrencyGate::new(config.gate.clone()),
            QueryMonitor::new(config.monitor.clone()),
            ShapeDetector::new(config.detector.clone(), scheduler),
        )
    }

    pub fn from_parts(
        gate: ConcurrencyGate,
        monitor: QueryMonitor,
        detector: ShapeDetector,
    ) -> Self {
        Self {
            gate,
            monitor,
            detector,
        }
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub fn monitor(&self) -> &QueryMonitor {
        &self.monitor
    }

    pub fn detector(&self) -> &ShapeDetector {
        &self.detector
    }

    /// Run one backing operation described by `signature`.
    ///
    /// The operation is recorded under its normalized shape, with the raw
    /// signature as context. Only time spent running `op` is measured; a
    /// caller that times out in the gate queue is recorded as failed with the
    /// time it waited.
    pub async fn run<T, E, F, Fut>(&self, signature: &str, op: F) -> Result<T, E>
    where
        E: From<PoolTimeout>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let shape = normalize(signature);
        self.detector.track_shape(shape.clone());

        let _guard = match self.gate.acquire(self.gate.config().acquire_timeout).await {
            Ok(guard) => guard,
            Err(timeout) => {
                self.monitor
                    .record_failed(&shape, timeout.waited, Some(signature));
                return Err(timeout.into());
            }
        };

        let start = Instant::now();
        let result = op().await;
        let elapsed = start.elapsed();

        if result.is_ok() {
            self.monitor.record(&shape, elapsed, Some(signature));
        } else {
            self.monitor.record_failed(&shape, elapsed, Some(signature));
        }
        result
    }
}
