//! Block cache statistics.
//!
//! # Usage
//!
//! ```rust
//! use tessera_core::{BlockCache, CacheConfig};
//!
//! let cache = BlockCache::new(CacheConfig::default());
//! let stats = cache.stats().snapshot();
//! assert_eq!(stats.hits, 0);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Block cache counters.
///
/// All counters are atomic and can be read while operations are in progress.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Lookups served from the cache.
    hits: AtomicU64,
    /// Lookups that fetched from the backend.
    misses: AtomicU64,
    /// Lookups that waited on another caller's in-flight fetch.
    coalesced: AtomicU64,
    /// Blocks inserted directly by writers.
    inserts: AtomicU64,
    /// Blocks evicted for capacity.
    evictions: AtomicU64,
    /// Backend fetches that failed.
    fetch_errors: AtomicU64,
    /// Bytes fetched from the backend.
    bytes_fetched: AtomicU64,
}

impl CacheStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self, bytes: u64) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.bytes_fetched.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fetch_error(&self) {
        self.fetch_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of cache hits.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Returns the number of backend fetches.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Returns the number of lookups that joined an in-flight fetch.
    pub fn coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    /// Returns the number of write-through inserts.
    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }

    /// Returns the number of evictions.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Returns the number of failed fetches.
    pub fn fetch_errors(&self) -> u64 {
        self.fetch_errors.load(Ordering::Relaxed)
    }

    /// Returns the total bytes fetched from the backend.
    pub fn bytes_fetched(&self) -> u64 {
        self.bytes_fetched.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            coalesced: self.coalesced(),
            inserts: self.inserts(),
            evictions: self.evictions(),
            fetch_errors: self.fetch_errors(),
            bytes_fetched: self.bytes_fetched(),
        }
    }
}

/// A point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CacheStatsSnapshot {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that fetched from the backend.
    pub misses: u64,
    /// Lookups that waited on another caller's fetch.
    pub coalesced: u64,
    /// Write-through inserts.
    pub inserts: u64,
    /// Capacity evictions.
    pub evictions: u64,
    /// Failed fetches.
    pub fetch_errors: u64,
    /// Bytes fetched from the backend.
    pub bytes_fetched: u64,
}

impl CacheStatsSnapshot {
    /// Fraction of lookups served without a backend fetch.
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses + self.coalesced;
        if total == 0 {
            return 0.0;
        }
        (self.hits + self.coalesced) as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = CacheStats::new();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss(100);
        stats.record_coalesced();
        stats.record_eviction();

        let snap = stats.snapshot();
        assert_eq!(snap.hits, 2);
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.bytes_fetched, 100);
        assert_eq!(snap.evictions, 1);
        assert!((snap.hit_ratio() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn empty_ratio_is_zero() {
        assert_eq!(CacheStatsSnapshot::default().hit_ratio(), 0.0);
    }
}
