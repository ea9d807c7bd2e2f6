//! Query performance monitor
//!
//! Records how long backing operations take, flags the slow ones and keeps a
//! bounded log of recent operations for inspection. Totals and per-operation
//! aggregates are cumulative until [`QueryMonitor::reset`]; the 95th
//! percentile is computed over the retained log.

#![allow(clippy::cast_precision_loss)] // Averages and percentiles are for reporting

use crate::config::MonitorConfig;
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::time::Instant;
use tracing::warn;

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_nanos() as f64 / 1_000_000.0)
}

/// One logged operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationRecord {
    pub name: String,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
    pub timestamp: SystemTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub slow: bool,
    pub failed: bool,
}

/// Aggregates for one operation name
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OperationStats {
    pub name: String,
    pub count: u64,
    pub slow: u64,
    pub failed: u64,
    #[serde(rename = "total_ms", serialize_with = "as_millis")]
    pub total: Duration,
    #[serde(rename = "average_ms", serialize_with = "as_millis")]
    pub average: Duration,
    #[serde(rename = "max_ms", serialize_with = "as_millis")]
    pub max: Duration,
}

/// Monitor snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorStats {
    pub total_operations: u64,
    pub slow_operations: u64,
    pub failed_operations: u64,
    #[serde(rename = "average_ms", serialize_with = "as_millis")]
    pub average: Duration,
    #[serde(rename = "max_ms", serialize_with = "as_millis")]
    pub max: Duration,
    /// 95th percentile over the retained log
    #[serde(rename = "p95_ms", serialize_with = "as_millis")]
    pub p95: Duration,
    /// Sorted by total time spent, highest first
    pub per_operation: Vec<OperationStats>,
}

#[derive(Debug, Default)]
struct Aggregate {
    count: u64,
    slow: u64,
    failed: u64,
    total: Duration,
    max: Duration,
}

impl Aggregate {
    fn add(&mut self, record: &OperationRecord) {
        self.count += 1;
        self.slow += u64::from(record.slow);
        self.failed += u64::from(record.failed);
        self.total += record.duration;
        self.max = self.max.max(record.duration);
    }

    fn average(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos((self.total.as_nanos() / u128::from(self.count)) as u64)
        }
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    log: VecDeque<OperationRecord>,
    overall: Aggregate,
    per_operation: HashMap<String, Aggregate>,
}

/// Records operation timings; cheap to clone and share
#[derive(Debug, Clone)]
pub struct QueryMonitor {
    config: MonitorConfig,
    state: Arc<Mutex<MonitorState>>,
}

impl QueryMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(MonitorState::default())),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Record a successful operation. Returns whether it was slow.
    pub fn record(&self, name: &str, duration: Duration, context: Option<&str>) -> bool {
        self.push(name, duration, context, false)
    }

    /// Record an operation that returned an error. Returns whether it was slow.
    pub fn record_failed(&self, name: &str, duration: Duration, context: Option<&str>) -> bool {
        self.push(name, duration, context, true)
    }

    /// Await `future` and record how long it took.
    pub async fn time<Fut: Future>(&self, name: &str, future: Fut) -> Fut::Output {
        let start = Instant::now();
        let output = future.await;
        self.record(name, start.elapsed(), None);
        output
    }

    /// Await a fallible `future`, recording it as failed when it errors.
    pub async fn time_result<T, E, Fut>(&self, name: &str, future: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let start = Instant::now();
        let output = future.await;
        self.push(name, start.elapsed(), None, output.is_err());
        output
    }

    fn push(&self, name: &str, duration: Duration, context: Option<&str>, failed: bool) -> bool {
        let slow = duration >= self.config.slow_threshold;
        if slow {
            warn!(
                "Slow operation '{}' took {:?} (threshold {:?}){}",
                name,
                duration,
                self.config.slow_threshold,
                context.map(|c| format!(" [{c}]")).unwrap_or_default()
            );
        }

        let record = OperationRecord {
            name: name.to_string(),
            duration,
            timestamp: SystemTime::now(),
            context: context.map(ToString::to_string),
            slow,
            failed,
        };

        let mut state = self.state.lock();
        state.overall.add(&record);
        state
            .per_operation
            .entry(record.name.clone())
            .or_default()
            .add(&record);

        while state.log.len() >= self.config.max_log_size.max(1) {
            state.log.pop_front();
        }
        state.log.push_back(record);

        slow
    }

    pub fn stats(&self) -> MonitorStats {
        let state = self.state.lock();

        let mut durations: Vec<Duration> = state.log.iter().map(|r| r.duration).collect();
        durations.sort_unstable();
        let p95 = percentile(&durations, 0.95);

        let mut per_operation: Vec<OperationStats> = state
            .per_operation
            .iter()
            .map(|(name, agg)| OperationStats {
                name: name.clone(),
                count: agg.count,
                slow: agg.slow,
                failed: agg.failed,
                total: agg.total,
                average: agg.average(),
                max: agg.max,
            })
            .collect();
        per_operation.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.name.cmp(&b.name)));

        MonitorStats {
            total_operations: state.overall.count,
            slow_operations: state.overall.slow,
            failed_operations: state.overall.failed,
            average: state.overall.average(),
            max: state.overall.max,
            p95,
            per_operation,
        }
    }

    /// The `n` slowest logged operations, slowest first.
    pub fn slowest(&self, n: usize) -> Vec<OperationRecord> {
        let mut records: Vec<OperationRecord> = self.state.lock().log.iter().cloned().collect();
        records.sort_by(|a, b| b.duration.cmp(&a.duration));
        records.truncate(n);
        records
    }

    /// The `n` most recent logged operations, newest first.
    pub fn recent(&self, n: usize) -> Vec<OperationRecord> {
        self.state.lock().log.iter().rev().take(n).cloned().collect()
    }

    pub fn reset(&self) {
        *self.state.lock() = MonitorState::default();
    }
}

/// Nearest-rank percentile of sorted values.
fn percentile(sorted: &[Duration], quantile: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let rank = (quantile * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
#[allow(clippy::panic)]
#[allow(clippy::expect_used)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn monitor() -> QueryMonitor {
        QueryMonitor::new(
            MonitorConfig::new()
                .with_slow_threshold(Duration::from_millis(100))
                .with_max_log_size(5),
        )
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_slow_classification() {
        let monitor = monitor();
        assert!(!monitor.record("users.find", ms(99), None));
        assert!(monitor.record("users.find", ms(100), Some("GET /users")));
        assert!(monitor.record_failed("posts.list", ms(250), None));

        let stats = monitor.stats();
        assert_eq!(stats.total_operations, 3);
        assert_eq!(stats.slow_operations, 2);
        assert_eq!(stats.failed_operations, 1);
        assert_eq!(stats.max, ms(250));

        let recent = monitor.recent(2);
        assert_eq!(recent[0].name, "posts.list");
        assert!(recent[0].failed);
        assert_eq!(recent[1].context.as_deref(), Some("GET /users"));
    }

    #[test]
    fn test_log_is_bounded_fifo() {
        let monitor = monitor();
        for i in 1..=8 {
            monitor.record(&format!("op{i}"), ms(i), None);
        }

        let recent = monitor.recent(10);
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0].name, "op8");
        assert_eq!(recent[4].name, "op4");
        // Totals are cumulative beyond the log window
        assert_eq!(monitor.stats().total_operations, 8);
    }

    #[test]
    fn test_aggregates_and_percentile() {
        let monitor = QueryMonitor::new(MonitorConfig::new().with_max_log_size(100));
        for i in 1..=20 {
            monitor.record("a", ms(i * 10), None);
        }
        monitor.record("b", ms(5), None);

        let stats = monitor.stats();
        assert_eq!(stats.p95, ms(190));
        assert_eq!(stats.per_operation[0].name, "a");
        assert_eq!(stats.per_operation[0].count, 20);
        assert_eq!(stats.per_operation[0].average, ms(105));
        assert_eq!(stats.per_operation[0].total, ms(2100));
        assert_eq!(stats.per_operation[0].max, ms(200));
        assert_eq!(stats.per_operation[1].name, "b");

        let slowest = monitor.slowest(2);
        assert_eq!(slowest[0].duration, ms(200));
        assert_eq!(slowest[1].duration, ms(190));
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_and_time_result() {
        let monitor = monitor();
        let value = monitor
            .time("sleepy", async {
                tokio::time::sleep(ms(150)).await;
                7
            })
            .await;
        assert_eq!(value, 7);

        let result = monitor
            .time_result("failing", async { Err::<(), _>("boom") })
            .await;
        assert!(result.is_err());

        let stats = monitor.stats();
        assert_eq!(stats.slow_operations, 1);
        assert_eq!(stats.failed_operations, 1);
        assert_eq!(monitor.slowest(1)[0].name, "sleepy");
    }

    #[test]
    fn test_reset_and_empty_stats() {
        let monitor = monitor();
        monitor.record("op", ms(1), None);
        monitor.reset();
        assert_eq!(monitor.stats(), MonitorStats::default());
        assert!(monitor.recent(1).is_empty());
    }

    #[test]
    fn test_serializes_durations_as_millis() {
        let monitor = monitor();
        monitor.record("op", ms(12), None);
        let json = serde_json::to_value(monitor.stats()).expect("serialize");
        assert_eq!(json["max_ms"], 12.0);
        assert_eq!(json["per_operation"][0]["name"], "op");
    }
}
