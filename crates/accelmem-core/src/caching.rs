//! Provider caching device memory and pinned host memory.

use std::sync::Arc;

use crate::cache::{bucket_size, BlockCache};
use crate::config::CacheConfig;
use crate::device::{DeviceId, DevicePtr, MemoryDriver};
use crate::error::{MemoryError, Result};
use crate::pinned::HostPinnedCachingProvider;
use crate::point::{AllocationPoint, AllocationStatus, PointersPair};
use crate::provider::{check_release, check_request, MemoryProvider};
use crate::shape::AllocationShape;
use crate::stats::CacheStats;
use crate::tracker::MemoryTracker;

/// Keeps freed device blocks on per-device free lists keyed by bucket.
///
/// A request whose bucket has a retained block is a hit: the allocated
/// counter grows, the cached counter shrinks by the same bucket, and no
/// hardware call is made. Host requests go to an embedded
/// [`HostPinnedCachingProvider`].
pub struct FullCachingProvider {
    host: HostPinnedCachingProvider,
    tracker: Arc<MemoryTracker>,
    driver: Arc<dyn MemoryDriver>,
    caches: Vec<BlockCache<DevicePtr>>,
}

impl FullCachingProvider {
    /// Create a provider with one device cache per device of `driver`.
    #[must_use]
    pub fn new(
        tracker: Arc<MemoryTracker>,
        driver: Arc<dyn MemoryDriver>,
        config: &CacheConfig,
    ) -> Self {
        let caches = (0..driver.device_count())
            .map(|_| {
                BlockCache::new(
                    config.max_device_cache_bytes,
                    config.max_cacheable_block_bytes,
                )
            })
            .collect();
        Self {
            host: HostPinnedCachingProvider::new(Arc::clone(&tracker), Arc::clone(&driver), config),
            tracker,
            driver,
            caches,
        }
    }

    fn cache(&self, device: DeviceId) -> Result<&BlockCache<DevicePtr>> {
        self.caches
            .get(device)
            .ok_or_else(|| MemoryError::InvalidHandle(format!("unknown device {device}")))
    }

    fn malloc_device(&self, device: DeviceId, bytes: u64) -> Result<DevicePtr> {
        let cache = self.cache(device)?;
        let bucket = bucket_size(bytes);
        if let Some(ptr) = cache.acquire(bucket) {
            self.tracker.decrement_cached_amount(device, bucket)?;
            self.tracker.increment_allocated_amount(device, bucket)?;
            tracing::trace!(device, bucket, %ptr, "device cache hit");
            return Ok(ptr);
        }
        let ptr = self
            .driver
            .malloc_device(device, bucket)
            .map_err(|e| MemoryError::from_alloc(device, bytes, e))?;
        cache.register(ptr, bucket);
        self.tracker.increment_allocated_amount(device, bucket)?;
        tracing::trace!(device, bucket, %ptr, "device cache miss");
        Ok(ptr)
    }

    fn free_device(&self, device: DeviceId, ptr: DevicePtr) -> Result<()> {
        let cache = self.cache(device)?;
        let bucket = cache.forget(ptr).ok_or_else(|| {
            self.tracker.defect(MemoryError::InvalidHandle(format!(
                "device pointer {ptr} was not issued by this provider on device {device}"
            )))
        })?;
        self.tracker.decrement_allocated_amount(device, bucket)?;
        self.tracker.increment_cached_amount(device, bucket)?;
        if !cache.release(ptr, bucket) {
            self.tracker.decrement_cached_amount(device, bucket)?;
            self.driver.free_device(device, ptr)?;
            tracing::debug!(device, bucket, "device block evicted to hardware");
        }
        Ok(())
    }

    /// Device bytes retained by the cache of `device`.
    #[must_use]
    pub fn cached_bytes(&self, device: DeviceId) -> u64 {
        self.caches.get(device).map_or(0, BlockCache::cached_bytes)
    }

    /// Pinned host bytes retained by the embedded host cache of `device`.
    #[must_use]
    pub fn host_cached_bytes(&self, device: DeviceId) -> u64 {
        self.host.cached_bytes(device)
    }
}

impl MemoryProvider for FullCachingProvider {
    fn malloc(
        &self,
        shape: &AllocationShape,
        point: &AllocationPoint,
        status: AllocationStatus,
    ) -> Result<PointersPair> {
        let bytes = check_request(shape, status)?;
        if status == AllocationStatus::Host {
            return self.host.malloc(shape, point, status);
        }
        self.malloc_device(point.device_id(), bytes)
            .map(PointersPair::device)
    }

    fn free(&self, point: &mut AllocationPoint) -> Result<()> {
        check_release(point).map_err(|e| self.tracker.defect(e))?;
        let Some(ptr) = point.device_pointer() else {
            return self.host.free(point);
        };
        self.free_device(point.device_id(), ptr)?;
        point.mark_deallocated();
        Ok(())
    }

    fn purge_cache(&self) -> Result<u64> {
        let mut released = 0;
        let mut first_error = None;
        for (device, cache) in self.caches.iter().enumerate() {
            let purged = cache.purge(|ptr, bucket| {
                self.driver.free_device(device, ptr)?;
                self.tracker.decrement_cached_amount(device, bucket)?;
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
            tracing::debug!(released, "device caches purged");
        }
        match (self.host.purge_cache(), first_error) {
            (_, Some(e)) | (Err(e), None) => Err(e),
            (Ok(host), None) => Ok(released + host),
        }
    }

    fn cache_stats(&self) -> CacheStats {
        self.caches
            .iter()
            .map(BlockCache::stats)
            .fold(self.host.cache_stats(), |acc, s| acc + s)
    }

    fn name(&self) -> &'static str {
        "full-caching"
    }
}

impl Drop for FullCachingProvider {
    fn drop(&mut self) {
        if let Err(e) = self.purge_cache() {
            tracing::warn!(error = %e, "failed to purge device caches on drop");
        }
    }
}
