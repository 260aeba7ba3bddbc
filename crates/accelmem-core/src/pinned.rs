//! Provider caching pinned host memory.

use std::sync::Arc;

use crate::cache::{bucket_size, BlockCache};
use crate::config::CacheConfig;
use crate::device::{DeviceId, HostPtr, MemoryDriver};
use crate::direct::DirectProvider;
use crate::error::{MemoryError, Result};
use crate::point::{AllocationPoint, AllocationStatus, PointersPair};
use crate::provider::{check_release, check_request, MemoryProvider};
use crate::shape::AllocationShape;
use crate::stats::CacheStats;
use crate::tracker::MemoryTracker;

/// Caches freed pinned host blocks per device. Device requests go straight
/// to hardware through an embedded [`DirectProvider`].
pub struct HostPinnedCachingProvider {
    direct: DirectProvider,
    tracker: Arc<MemoryTracker>,
    driver: Arc<dyn MemoryDriver>,
    caches: Vec<BlockCache<HostPtr>>,
}

impl HostPinnedCachingProvider {
    /// Create a provider with one host cache per device of `driver`.
    #[must_use]
    pub fn new(
        tracker: Arc<MemoryTracker>,
        driver: Arc<dyn MemoryDriver>,
        config: &CacheConfig,
    ) -> Self {
        let caches = (0..driver.device_count())
            .map(|_| BlockCache::new(config.max_host_cache_bytes, config.max_cacheable_block_bytes))
            .collect();
        Self {
            direct: DirectProvider::new(Arc::clone(&tracker), Arc::clone(&driver)),
            tracker,
            driver,
            caches,
        }
    }

    fn cache(&self, device: DeviceId) -> Result<&BlockCache<HostPtr>> {
        self.caches
            .get(device)
            .ok_or_else(|| MemoryError::InvalidHandle(format!("unknown device {device}")))
    }

    fn malloc_host(&self, device: DeviceId, bytes: u64) -> Result<HostPtr> {
        let cache = self.cache(device)?;
        let bucket = bucket_size(bytes);
        if let Some(ptr) = cache.acquire(bucket) {
            self.tracker.decrement_host_cached_amount(device, bucket)?;
            self.tracker.increment_host_allocated_amount(device, bucket)?;
            tracing::trace!(device, bucket, %ptr, "pinned cache hit");
            return Ok(ptr);
        }
        let ptr = self
            .driver
            .malloc_pinned(device, bucket)
            .map_err(|e| MemoryError::from_alloc(device, bytes, e))?;
        cache.register(ptr, bucket);
        self.tracker.increment_host_allocated_amount(device, bucket)?;
        tracing::trace!(device, bucket, %ptr, "pinned cache miss");
        Ok(ptr)
    }

    fn free_host(&self, device: DeviceId, ptr: HostPtr) -> Result<()> {
        let cache = self.cache(device)?;
        let bucket = cache.forget(ptr).ok_or_else(|| {
            self.tracker.defect(MemoryError::InvalidHandle(format!(
                "host pointer {ptr} was not issued by this provider on device {device}"
            )))
        })?;
        self.tracker.decrement_host_allocated_amount(device, bucket)?;
        self.tracker.increment_host_cached_amount(device, bucket)?;
        if !cache.release(ptr, bucket) {
            self.tracker.decrement_host_cached_amount(device, bucket)?;
            self.driver.free_pinned(device, ptr)?;
            tracing::debug!(device, bucket, "pinned block evicted to hardware");
        }
        Ok(())
    }

    /// Pinned bytes retained by the cache of `device`.
    #[must_use]
    pub fn cached_bytes(&self, device: DeviceId) -> u64 {
        self.caches.get(device).map_or(0, BlockCache::cached_bytes)
    }
}

impl MemoryProvider for HostPinnedCachingProvider {
    fn malloc(
        &self,
        shape: &AllocationShape,
        point: &AllocationPoint,
        status: AllocationStatus,
    ) -> Result<PointersPair> {
        let bytes = check_request(shape, status)?;
        if status == AllocationStatus::Device {
            return self.direct.malloc(shape, point, status);
        }
        self.malloc_host(point.device_id(), bytes)
            .map(PointersPair::host)
    }

    fn free(&self, point: &mut AllocationPoint) -> Result<()> {
        check_release(point).map_err(|e| self.tracker.defect(e))?;
        if point.device_pointer().is_some() {
            return self.direct.free(point);
        }
        if let Some(ptr) = point.host_pointer() {
            self.free_host(point.device_id(), ptr)?;
        }
        point.mark_deallocated();
        Ok(())
    }

    fn purge_cache(&self) -> Result<u64> {
        let mut released = 0;
        let mut first_error = None;
        for (device, cache) in self.caches.iter().enumerate() {
            let purged = cache.purge(|ptr, bucket| {
                self.driver.free_pinned(device, ptr)?;
                self.tracker.decrement_host_cached_amount(device, bucket)?;
                Ok(())
            });
            match purged {
                Ok(bytes) => released += bytes,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        if released > 0 {
            tracing::debug!(released, "pinned caches purged");
        }
        first_error.map_or(Ok(released), Err)
    }

    fn cache_stats(&self) -> CacheStats {
        self.caches
            .iter()
            .map(BlockCache::stats)
            .fold(self.direct.cache_stats(), |acc, s| acc + s)
    }

    fn name(&self) -> &'static str {
        "host-pinned-caching"
    }
}

impl Drop for HostPinnedCachingProvider {
    fn drop(&mut self) {
        if let Err(e) = self.purge_cache() {
            tracing::warn!(error = %e, "failed to purge pinned caches on drop");
        }
    }
}
