//! Error types for cache and data-access operations

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during cache store operations
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backing key-value store could not be reached
    ///
    /// Callers should fail open to the backing data source; only the cache
    /// benefit is lost.
    #[error("Cache store unavailable: {0}")]
    StoreUnavailable(String),

    /// A zero TTL was supplied to `set`
    #[error("Invalid TTL: must be greater than zero")]
    InvalidTtl,

    /// A glob pattern could not be compiled
    #[error("Invalid key pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The rejected pattern
        pattern: String,
        /// Why it was rejected
        reason: String,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Invalid configuration
    #[error("Invalid cache configuration: {0}")]
    InvalidConfiguration(String),
}

impl CacheError {
    /// True for transport-level failures where the caller should bypass the cache.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

/// Result type alias for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// A caller waited in the concurrency gate queue past its deadline
///
/// The queued operation was never started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Pool timeout: no concurrency slot became free within {waited:?}")]
pub struct PoolTimeout {
    /// How long the caller was queued before giving up
    pub waited: Duration,
}

/// Errors returned by [`BatchLoader::load`](crate::loader::BatchLoader::load)
///
/// The upstream error type `E` is passed through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError<E> {
    /// The batch succeeded but this key failed
    #[error("Batch key error: {0}")]
    Key(E),

    /// The whole batch call failed
    #[error("Batch failed: {0}")]
    Batch(E),

    /// The batch function returned the wrong number of results
    #[error("Batch function returned {actual} results for {expected} keys")]
    ResultCount {
        /// Number of keys passed to the batch function
        expected: usize,
        /// Number of results it returned
        actual: usize,
    },

    /// The batch task ended without resolving this key
    #[error("Batch was dropped before resolving the key")]
    Dropped,
}

impl<E> LoadError<E> {
    /// The upstream error, if this failure carries one.
    pub fn upstream(&self) -> Option<&E> {
        match self {
            Self::Key(err) | Self::Batch(err) => Some(err),
            Self::ResultCount { .. } | Self::Dropped => None,
        }
    }
}
