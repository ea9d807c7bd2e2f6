//! Prometheus export of cache, gate and monitor statistics
//!
//! The layer keeps its own counters; [`PrometheusExporter::update`] mirrors a
//! [`DiagnosticsReport`] into a Prometheus registry. Counters only move
//! forward: after a `reset_stats` they hold their value until the source
//! counts pass it again.

use crate::diagnostics::DiagnosticsReport;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::time::Duration;

/// Prometheus metrics exporter for the cache layer
#[derive(Debug, Clone)]
pub struct PrometheusExporter {
    registry: Registry,

    // Cache store
    cache_hits: IntCounter,
    cache_misses: IntCounter,
    cache_sets: IntCounter,
    cache_deletes: IntCounter,
    cache_expirations: IntCounter,
    cache_errors: IntCounter,
    cache_entries: IntGauge,
    cache_tags: IntGauge,

    // Concurrency gate
    gate_active: IntGauge,
    gate_queued: IntGauge,
    gate_executed: IntCounter,
    gate_timeouts: IntCounter,

    // Monitor and detector
    operations: IntCounter,
    slow_operations: IntCounter,
    failed_operations: IntCounter,
    operation_duration: Histogram,
    hot_shapes: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    let gauge = IntGauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

/// Advance a mirrored counter to `value`.
fn advance(counter: &IntCounter, value: u64) {
    counter.inc_by(value.saturating_sub(counter.get()));
}

#[allow(clippy::cast_possible_wrap)]
fn set_gauge(gauge: &IntGauge, value: usize) {
    gauge.set(value as i64);
}

impl PrometheusExporter {
    /// Create and register all metrics
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let operation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "cachegate_operation_duration_seconds",
                "Duration distribution of backing operations",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(operation_duration.clone()))?;

        Ok(Self {
            cache_hits: counter(
                &registry,
                "cachegate_cache_hits_total",
                "Cache reads that found a live entry",
            )?,
            cache_misses: counter(
                &registry,
                "cachegate_cache_misses_total",
                "Cache reads that found nothing",
            )?,
            cache_sets: counter(&registry, "cachegate_cache_sets_total", "Entries written")?,
            cache_deletes: counter(
                &registry,
                "cachegate_cache_deletes_total",
                "Entries removed explicitly or by invalidation",
            )?,
            cache_expirations: counter(
                &registry,
                "cachegate_cache_expirations_total",
                "Entries removed after their TTL",
            )?,
            cache_errors: counter(
                &registry,
                "cachegate_cache_errors_total",
                "Failed store operations",
            )?,
            cache_entries: gauge(&registry, "cachegate_cache_entries", "Entries currently stored")?,
            cache_tags: gauge(&registry, "cachegate_cache_tags", "Tags currently indexed")?,
            gate_active: gauge(
                &registry,
                "cachegate_gate_active",
                "Operations holding a concurrency slot",
            )?,
            gate_queued: gauge(
                &registry,
                "cachegate_gate_queued",
                "Callers waiting for a concurrency slot",
            )?,
            gate_executed: counter(
                &registry,
                "cachegate_gate_executed_total",
                "Operations admitted by the gate",
            )?,
            gate_timeouts: counter(
                &registry,
                "cachegate_gate_timeouts_total",
                "Callers that gave up waiting for a slot",
            )?,
            operations: counter(
                &registry,
                "cachegate_operations_total",
                "Backing operations recorded",
            )?,
            slow_operations: counter(
                &registry,
                "cachegate_slow_operations_total",
                "Backing operations at or above the slow threshold",
            )?,
            failed_operations: counter(
                &registry,
                "cachegate_failed_operations_total",
                "Backing operations that returned an error",
            )?,
            hot_shapes: gauge(
                &registry,
                "cachegate_hot_shapes",
                "Operation shapes above the repetition threshold",
            )?,
            operation_duration,
            registry,
        })
    }

    /// Mirror a diagnostics snapshot into the registry
    pub fn update(&self, report: &DiagnosticsReport) {
        let cache = &report.cache;
        advance(&self.cache_hits, cache.hits);
        advance(&self.cache_misses, cache.misses);
        advance(&self.cache_sets, cache.sets);
        advance(&self.cache_deletes, cache.deletes);
        advance(&self.cache_expirations, cache.expirations);
        advance(&self.cache_errors, cache.errors);
        set_gauge(&self.cache_entries, cache.entries);
        set_gauge(&self.cache_tags, cache.tags);

        let gate = &report.gate;
        set_gauge(&self.gate_active, gate.active);
        set_gauge(&self.gate_queued, gate.queued);
        advance(&self.gate_executed, gate.total_executed);
        advance(&self.gate_timeouts, gate.total_timeouts);

        let monitor = &report.monitor;
        advance(&self.operations, monitor.total_operations);
        advance(&self.slow_operations, monitor.slow_operations);
        advance(&self.failed_operations, monitor.failed_operations);
        set_gauge(&self.hot_shapes, report.hot_shapes.len());
    }

    /// Record one backing operation's duration
    pub fn record_operation_time(&self, duration: Duration) {
        self.operation_duration.observe(duration.as_secs_f64());
    }

    /// Get Prometheus registry for serving metrics
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> String {
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
#[allow(clippy::expect_used)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{gate::GateStats, monitor::MonitorStats, stats::CacheStats};

    fn report(hits: u64) -> DiagnosticsReport {
        DiagnosticsReport {
            cache: CacheStats {
                hits,
                misses: 2,
                entries: 4,
                ..CacheStats::default()
            },
            gate: GateStats {
                limit: 10,
                total_executed: 6,
                ..GateStats::default()
            },
            monitor: MonitorStats::default(),
            hot_shapes: Vec::new(),
        }
    }

    #[test]
    fn test_update_mirrors_report() {
        let exporter = PrometheusExporter::new().expect("exporter");
        exporter.update(&report(7));
        exporter.record_operation_time(Duration::from_millis(20));

        assert_eq!(exporter.cache_hits.get(), 7);
        assert_eq!(exporter.cache_entries.get(), 4);
        assert_eq!(exporter.gate_executed.get(), 6);

        let output = exporter.gather();
        assert!(output.contains("cachegate_cache_hits_total 7"));
        assert!(output.contains("cachegate_operation_duration_seconds_count 1"));
    }

    #[test]
    fn test_counters_do_not_move_backwards() {
        let exporter = PrometheusExporter::new().expect("exporter");
        exporter.update(&report(9));
        exporter.update(&report(3));
        assert_eq!(exporter.cache_hits.get(), 9);
        exporter.update(&report(12));
        assert_eq!(exporter.cache_hits.get(), 12);
    }
}
