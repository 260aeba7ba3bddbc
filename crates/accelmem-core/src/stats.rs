//! Provider cache statistics.

use std::ops::Add;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Cache activity and block population of a provider.
///
/// `hits`, `misses` and `evictions` are cumulative. The block counts are
/// taken at snapshot time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Requests served from the cache without a hardware call.
    pub hits: u64,
    /// Requests that needed a hardware allocation.
    pub misses: u64,
    /// Freed blocks released to hardware instead of being cached.
    pub evictions: u64,
    /// Blocks retained for reuse.
    pub cached_blocks: u64,
    /// Blocks handed out and not yet freed.
    pub issued_blocks: u64,
}

impl CacheStats {
    /// Fraction of requests served from the cache, 0 when nothing was
    /// requested.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let requests = self.hits + self.misses;
        if requests == 0 {
            0.0
        } else {
            self.hits as f64 / requests as f64
        }
    }
}

impl Add for CacheStats {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            hits: self.hits + rhs.hits,
            misses: self.misses + rhs.misses,
            evictions: self.evictions + rhs.evictions,
            cached_blocks: self.cached_blocks + rhs.cached_blocks,
            issued_blocks: self.issued_blocks + rhs.issued_blocks,
        }
    }
}

/// Lock-free hit/miss/eviction counters of one cache.
#[derive(Default)]
pub(crate) struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheCounters {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Activity counters with the given block population.
    pub(crate) fn snapshot(&self, cached_blocks: u64, issued_blocks: u64) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            cached_blocks,
            issued_blocks,
        }
    }
}
