//! Cache statistics and metrics types
//!
//! Counters are updated with relaxed atomics on the hot path and read into a
//! [`CacheStats`] snapshot for diagnostics.

#![allow(clippy::cast_precision_loss)] // Statistics calculations intentionally accept precision loss

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

// Use cache-aligned atomics to reduce false sharing
#[repr(align(64))] // Cache line alignment
#[derive(Debug, Default)]
struct CacheAlignedAtomicU64(AtomicU64);

impl CacheAlignedAtomicU64 {
    #[inline]
    fn load(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    #[inline]
    fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    #[inline]
    fn clear(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Reads that returned a live value
    pub hits: u64,
    /// Reads that found nothing or an expired entry
    pub misses: u64,
    /// Successful writes
    pub sets: u64,
    /// Entries removed by delete, pattern delete, tag invalidation or flush
    pub deletes: u64,
    /// Entries removed because their TTL elapsed
    pub expirations: u64,
    /// Failed store operations
    pub errors: u64,
    /// `hits / (hits + misses)`, 0.0 before the first read
    pub hit_rate: f64,
    /// Live entries at snapshot time
    pub entries: usize,
    /// Tags with at least one indexed key at snapshot time
    pub tags: usize,
}

impl CacheStats {
    /// Total read operations
    #[inline]
    pub fn reads(&self) -> u64 {
        self.hits + self.misses
    }

    /// Calculate miss rate (misses / total reads)
    #[inline]
    pub fn miss_rate(&self) -> f64 {
        let reads = self.reads();
        if reads == 0 {
            0.0
        } else {
            self.misses as f64 / reads as f64
        }
    }
}

/// Atomic counters backing [`CacheStats`]
///
/// Shared by store implementations; every method is safe to call from many
/// threads at once.
#[derive(Debug, Default)]
pub struct AtomicCacheMetrics {
    hits: CacheAlignedAtomicU64,
    misses: CacheAlignedAtomicU64,
    sets: CacheAlignedAtomicU64,
    deletes: CacheAlignedAtomicU64,
    expirations: CacheAlignedAtomicU64,
    errors: CacheAlignedAtomicU64,
}

impl AtomicCacheMetrics {
    /// Create zeroed metrics
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a read
    #[inline]
    pub fn record_get(&self, hit: bool) {
        if hit {
            self.hits.incr();
        } else {
            self.misses.incr();
        }
    }

    /// Record a write
    #[inline]
    pub fn record_set(&self) {
        self.sets.incr();
    }

    /// Record `count` removed entries
    #[inline]
    pub fn record_deletes(&self, count: usize) {
        self.deletes.add(count as u64);
    }

    /// Record `count` expired entries
    #[inline]
    pub fn record_expirations(&self, count: usize) {
        self.expirations.add(count as u64);
    }

    /// Record a failed operation
    #[inline]
    pub fn record_error(&self) {
        self.errors.incr();
    }

    /// Snapshot the counters. `entries` and `tags` come from the store.
    pub fn snapshot(&self, entries: usize, tags: usize) -> CacheStats {
        let hits = self.hits.load();
        let misses = self.misses.load();
        let reads = hits + misses;

        CacheStats {
            hits,
            misses,
            sets: self.sets.load(),
            deletes: self.deletes.load(),
            expirations: self.expirations.load(),
            errors: self.errors.load(),
            hit_rate: if reads == 0 {
                0.0
            } else {
                hits as f64 / reads as f64
            },
            entries,
            tags,
        }
    }

    /// Reset all counters to zero
    pub fn reset(&self) {
        self.hits.clear();
        self.misses.clear();
        self.sets.clear();
        self.deletes.clear();
        self.expirations.clear();
        self.errors.clear();
    }
}
