//! Configuration structures
//!
//! Each component has its own configuration with sensible defaults, builder
//! style `with_*` setters and a `validate` method. [`LayerConfig`] bundles
//! them for applications that build the whole layer at once.

use crate::error::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

/// Cache store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Prefix applied to every key in the backing store
    pub namespace: String,
    /// TTL used when a caller does not supply one
    pub default_ttl: Duration,
    /// Interval of the background sweep for expired entries (zero disables it)
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "cache:".to_string(),
            default_ttl: Duration::from_secs(300), // 5 minutes
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// Create a new cache configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the key namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set default TTL
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set sweep interval
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.default_ttl.as_secs() == 0 {
            return Err("default_ttl must be at least one second".to_string());
        }

        if self.namespace.contains(['*', '?', '[', ']', '\\']) {
            return Err("namespace must not contain glob metacharacters".to_string());
        }

        Ok(())
    }
}

/// Concurrency gate configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Maximum number of operations running at once
    pub max_concurrent: usize,
    /// How long a caller may wait in the queue for a slot
    pub acquire_timeout: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl GateConfig {
    /// Create a new gate configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the concurrency limit
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Set the queue timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent == 0 {
            return Err("max_concurrent must be greater than 0".to_string());
        }

        // tokio's semaphore caps permits at usize::MAX >> 3
        if self.max_concurrent > tokio::sync::Semaphore::MAX_PERMITS {
            return Err(format!(
                "max_concurrent must not exceed {}",
                tokio::sync::Semaphore::MAX_PERMITS
            ));
        }

        if self.acquire_timeout.is_zero() {
            return Err("acquire_timeout must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Query performance monitor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Operations at or above this duration are classified as slow
    pub slow_threshold: Duration,
    /// Maximum operation log entries kept (oldest dropped first)
    pub max_log_size: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            slow_threshold: Duration::from_millis(100),
            max_log_size: 1_000,
        }
    }
}

impl MonitorConfig {
    /// Create a new monitor configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set slow operation threshold
    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    /// Set maximum log size
    pub fn with_max_log_size(mut self, max_log_size: usize) -> Self {
        self.max_log_size = max_log_size;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_log_size == 0 {
            return Err("max_log_size must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Repeated-shape (N+1) detector configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// A shape repeated more than this many times in one window is reported
    pub threshold: u64,
    /// Length of the counting window; counters are cleared when it elapses
    pub window: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            window: Duration::from_secs(60),
        }
    }
}

impl DetectorConfig {
    /// Create a new detector configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the reporting threshold
    pub fn with_threshold(mut self, threshold: u64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set the window length
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.window.is_zero() {
            return Err("window must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Batching loader configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// A batch is dispatched as soon as it holds this many distinct keys
    pub max_batch_size: usize,
    /// A batch is dispatched this long after its first key was queued
    pub batch_delay: Duration,
    /// Keep resolved values for the lifetime of the loader
    pub memoize: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            batch_delay: Duration::from_millis(10),
            memoize: true,
        }
    }
}

impl LoaderConfig {
    /// Create a new loader configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum batch size
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Set batch delay
    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    /// Enable or disable per-instance memoization
    pub fn with_memoize(mut self, memoize: bool) -> Self {
        self.memoize = memoize;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_batch_size == 0 {
            return Err("max_batch_size must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Configuration for the whole layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    /// Cache store settings
    pub cache: CacheConfig,
    /// Concurrency gate settings
    pub gate: GateConfig,
    /// Query monitor settings
    pub monitor: MonitorConfig,
    /// Shape detector settings
    pub detector: DetectorConfig,
    /// Batching loader settings
    pub loader: LoaderConfig,
}

impl LayerConfig {
    /// Create a configuration with all defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from a JSON file; missing fields use defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> CacheResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CacheError::InvalidConfiguration(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            CacheError::InvalidConfiguration(format!("cannot parse {}: {e}", path.display()))
        })?;
        config.validate().map_err(CacheError::InvalidConfiguration)?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), String> {
        self.cache.validate().map_err(|e| format!("cache: {e}"))?;
        self.gate.validate().map_err(|e| format!("gate: {e}"))?;
        self.monitor.validate().map_err(|e| format!("monitor: {e}"))?;
        self.detector
            .validate()
            .map_err(|e| format!("detector: {e}"))?;
        self.loader.validate().map_err(|e| format!("loader: {e}"))?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
#[allow(clippy::expect_used)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        assert!(LayerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let cache = CacheConfig::new()
            .with_namespace("app:")
            .with_default_ttl(Duration::from_secs(60))
            .with_sweep_interval(Duration::ZERO);
        assert_eq!(cache.namespace, "app:");
        assert_eq!(cache.default_ttl, Duration::from_secs(60));
        assert!(cache.validate().is_ok());

        let gate = GateConfig::new()
            .with_max_concurrent(4)
            .with_acquire_timeout(Duration::from_millis(500));
        assert_eq!(gate.max_concurrent, 4);
        assert!(gate.validate().is_ok());

        let loader = LoaderConfig::new()
            .with_max_batch_size(25)
            .with_batch_delay(Duration::from_millis(2))
            .with_memoize(false);
        assert!(!loader.memoize);
        assert!(loader.validate().is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(
            CacheConfig::new()
                .with_default_ttl(Duration::from_millis(500))
                .validate()
                .is_err()
        );
        assert!(CacheConfig::new().with_namespace("a*").validate().is_err());
        assert!(GateConfig::new().with_max_concurrent(0).validate().is_err());
        assert!(
            GateConfig::new()
                .with_acquire_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(MonitorConfig::new().with_max_log_size(0).validate().is_err());
        assert!(
            DetectorConfig::new()
                .with_window(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(LoaderConfig::new().with_max_batch_size(0).validate().is_err());

        let mut layer = LayerConfig::default();
        layer.gate.max_concurrent = 0;
        let err = layer.validate().unwrap_err();
        assert!(err.starts_with("gate:"));
    }

    #[test]
    fn test_from_json_file_with_partial_config() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"{{"gate": {{"max_concurrent": 3, "acquire_timeout": {{"secs": 2, "nanos": 0}}}},
                "detector": {{"threshold": 5}}}}"#
        )
        .expect("write config");

        let config = LayerConfig::from_json_file(file.path()).expect("config should load");
        assert_eq!(config.gate.max_concurrent, 3);
        assert_eq!(config.gate.acquire_timeout, Duration::from_secs(2));
        assert_eq!(config.detector.threshold, 5);
        assert_eq!(config.detector.window, DetectorConfig::default().window);
        assert_eq!(config.cache, CacheConfig::default());
    }

    #[test]
    fn test_from_json_file_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{"loader": {{"max_batch_size": 0}}}}"#).expect("write config");

        match LayerConfig::from_json_file(file.path()) {
            Err(CacheError::InvalidConfiguration(msg)) => assert!(msg.contains("loader")),
            other => panic!("Expected InvalidConfiguration, got {other:?}"),
        }
    }
}
