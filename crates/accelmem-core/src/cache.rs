//! Size-bucketed free lists for caching providers.

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::Mutex;

use crate::error::Result;
use crate::stats::{CacheCounters, CacheStats};

/// Smallest bucket handed out by a caching provider.
pub const MIN_BUCKET_BYTES: u64 = 256;

/// Compute the bucket for a request (next power of two, at least
/// [`MIN_BUCKET_BYTES`]).
#[must_use]
pub fn bucket_size(bytes: u64) -> u64 {
    let bytes = bytes.max(MIN_BUCKET_BYTES);
    bytes.checked_next_power_of_two().unwrap_or(bytes)
}

struct CacheState<P> {
    free: HashMap<u64, Vec<P>>,
    issued: HashMap<P, u64>,
    cached_bytes: u64,
}

/// Free lists of retained blocks keyed by bucket, plus the set of blocks
/// currently issued to callers.
pub struct BlockCache<P> {
    state: Mutex<CacheState<P>>,
    max_cached_bytes: u64,
    max_block_bytes: u64,
    stats: CacheCounters,
}

impl<P: Copy + Eq + Hash> BlockCache<P> {
    /// Create a cache retaining at most `max_cached_bytes`, and no single
    /// block larger than `max_block_bytes`.
    #[must_use]
    pub fn new(max_cached_bytes: u64, max_block_bytes: u64) -> Self {
        Self {
            state: Mutex::new(CacheState {
                free: HashMap::new(),
                issued: HashMap::new(),
                cached_bytes: 0,
            }),
            max_cached_bytes,
            max_block_bytes,
            stats: CacheCounters::default(),
        }
    }

    /// Take a retained block of exactly `bucket` bytes and mark it issued.
    pub fn acquire(&self, bucket: u64) -> Option<P> {
        let mut state = self.state.lock();
        if let Some(block) = state.free.get_mut(&bucket).and_then(Vec::pop) {
            state.cached_bytes -= bucket;
            state.issued.insert(block, bucket);
            self.stats.record_hit();
            return Some(block);
        }
        self.stats.record_miss();
        None
    }

    /// Record a freshly allocated block as issued.
    pub fn register(&self, block: P, bucket: u64) {
        self.state.lock().issued.insert(block, bucket);
    }

    /// Stop tracking an issued block, returning its bucket. `None` means the
    /// block was never issued by this cache or was already returned.
    pub fn forget(&self, block: P) -> Option<u64> {
        self.state.lock().issued.remove(&block)
    }

    /// Offer a returned block for reuse. Returns `false` (and counts an
    /// eviction) when the block is too large or the cache is full; the caller
    /// must then release it to hardware.
    pub fn release(&self, block: P, bucket: u64) -> bool {
        if bucket > self.max_block_bytes {
            self.stats.record_eviction();
            return false;
        }
        let mut state = self.state.lock();
        if state.cached_bytes.saturating_add(bucket) > self.max_cached_bytes {
            self.stats.record_eviction();
            return false;
        }
        state.cached_bytes += bucket;
        state.free.entry(bucket).or_default().push(block);
        true
    }

    /// Remove every retained block, returning `(block, bucket)` pairs.
    pub fn drain(&self) -> Vec<(P, u64)> {
        let mut state = self.state.lock();
        state.cached_bytes = 0;
        std::mem::take(&mut state.free)
            .into_iter()
            .flat_map(|(bucket, blocks)| blocks.into_iter().map(move |b| (b, bucket)))
            .collect()
    }

    /// Drain the cache and hand every block to `release`, returning the
    /// bytes released. A failing block does not stop the others; the first
    /// error is returned once all blocks were offered.
    pub fn purge(&self, mut release: impl FnMut(P, u64) -> Result<()>) -> Result<u64> {
        let mut released = 0;
        let mut first_error = None;
        for (block, bucket) in self.drain() {
            match release(block, bucket) {
                Ok(()) => released += bucket,
                Err(e) => {
                    tracing::error!(bucket, error = %e, "failed to release cached block");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(released), Err)
    }

    /// Bytes currently retained.
    #[must_use]
    pub fn cached_bytes(&self) -> u64 {
        self.state.lock().cached_bytes
    }

    /// Activity counters plus the current retained and issued block counts.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let cached = state.free.values().map(Vec::len).sum::<usize>();
        self.stats.snapshot(cached as u64, state.issued.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_computation() {
        assert_eq!(bucket_size(0), 256);
        assert_eq!(bucket_size(16), 256);
        assert_eq!(bucket_size(256), 256);
        assert_eq!(bucket_size(257), 512);
        assert_eq!(bucket_size(4096), 4096);
        assert_eq!(bucket_size(4097), 8192);
    }

    #[test]
    fn release_then_acquire_is_a_hit() {
        let cache: BlockCache<u64> = BlockCache::new(1 << 20, 1 << 16);
        assert_eq!(cache.acquire(512), None);
        cache.register(7, 512);
        assert_eq!(cache.forget(7), Some(512));
        assert!(cache.release(7, 512));
        assert_eq!(cache.cached_bytes(), 512);

        assert_eq!(cache.acquire(512), Some(7));
        assert_eq!(cache.cached_bytes(), 0);
        let stats = cache.stats();
        assert_eq!(stats.issued_blocks, 1);
        assert_eq!(stats.cached_blocks, 0);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn buckets_do_not_mix() {
        let cache: BlockCache<u64> = BlockCache::new(1 << 20, 1 << 16);
        assert!(cache.release(1, 256));
        assert_eq!(cache.acquire(512), None);
        assert_eq!(cache.acquire(256), Some(1));
    }

    #[test]
    fn forget_unknown_block() {
        let cache: BlockCache<u64> = BlockCache::new(1024, 1024);
        assert_eq!(cache.forget(99), None);
        cache.register(1, 256);
        assert_eq!(cache.forget(1), Some(256));
        assert_eq!(cache.forget(1), None);
    }

    #[test]
    fn eviction_too_large() {
        let cache: BlockCache<u64> = BlockCache::new(1 << 20, 1024);
        assert!(!cache.release(1, 2048));
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.stats().cached_blocks, 0);
    }

    #[test]
    fn eviction_cache_full() {
        let cache: BlockCache<u64> = BlockCache::new(512, 1024);
        assert!(cache.release(1, 256));
        assert!(cache.release(2, 256));
        assert!(!cache.release(3, 256));
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.cached_bytes(), 512);
    }

    #[test]
    fn drain_empties_cache() {
        let cache: BlockCache<u64> = BlockCache::new(1 << 20, 1 << 20);
        cache.release(1, 256);
        cache.release(2, 1024);
        let mut drained = cache.drain();
        drained.sort_unstable();
        assert_eq!(drained, vec![(1, 256), (2, 1024)]);
        assert_eq!(cache.cached_bytes(), 0);
        assert_eq!(cache.stats().cached_blocks, 0);
    }

    #[test]
    fn purge_continues_after_failure() {
        let cache: BlockCache<u64> = BlockCache::new(1 << 20, 1 << 20);
        cache.release(1, 256);
        cache.release(2, 512);
        let mut seen = Vec::new();
        let result = cache.purge(|block, _| {
            seen.push(block);
            if block == 1 {
                Err(crate::error::MemoryError::InvalidHandle("gone".into()))
            } else {
                Ok(())
            }
        });
        assert!(result.is_err());
        assert_eq!(seen.len(), 2);
        assert_eq!(cache.stats().cached_blocks, 0);
    }

    #[test]
    fn purge_reports_released_bytes() {
        let cache: BlockCache<u64> = BlockCache::new(1 << 20, 1 << 20);
        cache.release(1, 256);
        cache.release(2, 512);
        assert_eq!(cache.purge(|_, _| Ok(())).unwrap(), 768);
    }
}
