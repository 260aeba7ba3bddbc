//! Provider that goes to hardware on every request.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::{DeviceId, DevicePtr, HostPtr, MemoryDriver};
use crate::error::{MemoryError, Result};
use crate::point::{AllocationPoint, AllocationStatus, PointersPair};
use crate::provider::{check_release, check_request, MemoryProvider};
use crate::shape::AllocationShape;
use crate::stats::CacheStats;
use crate::tracker::MemoryTracker;

/// Uncached provider: `malloc` and `free` map one-to-one onto driver calls.
///
/// Device requests move the allocated counter, host requests the host
/// allocated counter, both by the exact shape size. Every issued block is
/// recorded with its size; `free` only accepts recorded blocks and releases
/// exactly the recorded bytes.
pub struct DirectProvider {
    tracker: Arc<MemoryTracker>,
    driver: Arc<dyn MemoryDriver>,
    device_blocks: Mutex<HashMap<(DeviceId, DevicePtr), u64>>,
    host_blocks: Mutex<HashMap<(DeviceId, HostPtr), u64>>,
}

impl DirectProvider {
    /// Create a provider over `driver`, accounting into `tracker`.
    #[must_use]
    pub fn new(tracker: Arc<MemoryTracker>, driver: Arc<dyn MemoryDriver>) -> Self {
        Self {
            tracker,
            driver,
            device_blocks: Mutex::new(HashMap::new()),
            host_blocks: Mutex::new(HashMap::new()),
        }
    }

    fn malloc_device(&self, device: DeviceId, bytes: u64) -> Result<DevicePtr> {
        let ptr = self
            .driver
            .malloc_device(device, bytes)
            .map_err(|e| MemoryError::from_alloc(device, bytes, e))?;
        if let Err(e) = self.tracker.increment_allocated_amount(device, bytes) {
            self.driver.free_device(device, ptr)?;
            return Err(e);
        }
        self.device_blocks.lock().insert((device, ptr), bytes);
        tracing::trace!(device, bytes, %ptr, "direct device malloc");
        Ok(ptr)
    }

    fn malloc_host(&self, device: DeviceId, bytes: u64) -> Result<HostPtr> {
        let ptr = self
            .driver
            .malloc_pinned(device, bytes)
            .map_err(|e| MemoryError::from_alloc(device, bytes, e))?;
        if let Err(e) = self.tracker.increment_host_allocated_amount(device, bytes) {
            self.driver.free_pinned(device, ptr)?;
            return Err(e);
        }
        self.host_blocks.lock().insert((device, ptr), bytes);
        tracing::trace!(device, bytes, %ptr, "direct host malloc");
        Ok(ptr)
    }

    fn free_device(&self, device: DeviceId, ptr: DevicePtr) -> Result<()> {
        let bytes = self.device_blocks.lock().remove(&(device, ptr)).ok_or_else(|| {
            self.tracker.defect(MemoryError::InvalidHandle(format!(
                "device pointer {ptr} was not issued by this provider on device {device}"
            )))
        })?;
        if let Err(e) = self.driver.free_device(device, ptr) {
            self.device_blocks.lock().insert((device, ptr), bytes);
            return Err(e.into());
        }
        self.tracker.decrement_allocated_amount(device, bytes)?;
        Ok(())
    }

    fn free_host(&self, device: DeviceId, ptr: HostPtr) -> Result<()> {
        let bytes = self.host_blocks.lock().remove(&(device, ptr)).ok_or_else(|| {
            self.tracker.defect(MemoryError::InvalidHandle(format!(
                "host pointer {ptr} was not issued by this provider on device {device}"
            )))
        })?;
        if let Err(e) = self.driver.free_pinned(device, ptr) {
            self.host_blocks.lock().insert((device, ptr), bytes);
            return Err(e.into());
        }
        self.tracker.decrement_host_allocated_amount(device, bytes)?;
        Ok(())
    }

    fn owns(&self, point: &AllocationPoint) -> bool {
        let device = point.device_id();
        point
            .device_pointer()
            .map_or(true, |ptr| self.device_blocks.lock().contains_key(&(device, ptr)))
            && point
                .host_pointer()
                .map_or(true, |ptr| self.host_blocks.lock().contains_key(&(device, ptr)))
    }
}

impl MemoryProvider for DirectProvider {
    fn malloc(
        &self,
        shape: &AllocationShape,
        point: &AllocationPoint,
        status: AllocationStatus,
    ) -> Result<PointersPair> {
        let bytes = check_request(shape, status)?;
        let device = point.device_id();
        if status == AllocationStatus::Host {
            return self.malloc_host(device, bytes).map(PointersPair::host);
        }
        self.malloc_device(device, bytes).map(PointersPair::device)
    }

    fn free(&self, point: &mut AllocationPoint) -> Result<()> {
        check_release(point).map_err(|e| self.tracker.defect(e))?;
        if !self.owns(point) {
            return Err(self.tracker.defect(MemoryError::InvalidHandle(format!(
                "point {} was not issued by this provider",
                point.id()
            ))));
        }
        let device = point.device_id();
        if let Some(ptr) = point.device_pointer() {
            self.free_device(device, ptr)?;
        }
        if let Some(ptr) = point.host_pointer() {
            self.free_host(device, ptr)?;
        }
        point.mark_deallocated();
        Ok(())
    }

    fn cache_stats(&self) -> CacheStats {
        let issued = self.device_blocks.lock().len() + self.host_blocks.lock().len();
        CacheStats {
            issued_blocks: issued as u64,
            ..CacheStats::default()
        }
    }

    fn name(&self) -> &'static str {
        "direct"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimulatedDriver;

    fn setup() -> (Arc<SimulatedDriver>, Arc<MemoryTracker>, DirectProvider) {
        let driver = Arc::new(SimulatedDriver::new(2, 1 << 20));
        let tracker = Arc::new(MemoryTracker::new(driver.clone()));
        let provider = DirectProvider::new(Arc::clone(&tracker), driver.clone());
        (driver, tracker, provider)
    }

    #[test]
    fn device_round_trip_returns_to_baseline() {
        let (driver, tracker, provider) = setup();
        let shape = AllocationShape::new(13, 4);
        let mut point = AllocationPoint::new(1);

        provider
            .allocate(&shape, &mut point, AllocationStatus::Device)
            .unwrap();
        assert_eq!(point.status(), AllocationStatus::Device);
        assert_eq!(tracker.allocated_amount(1), 52);
        assert_eq!(tracker.allocated_amount(0), 0);

        provider.free(&mut point).unwrap();
        assert_eq!(point.status(), AllocationStatus::Deallocated);
        assert_eq!(tracker.allocated_amount(1), 0);
        assert_eq!(tracker.cached_amount(1), 0);
        assert_eq!(driver.hardware_calls().frees, 1);
    }

    #[test]
    fn host_requests_use_host_counters() {
        let (_driver, tracker, provider) = setup();
        let mut point = AllocationPoint::new(0);
        provider
            .allocate(&AllocationShape::new(8, 8), &mut point, AllocationStatus::Host)
            .unwrap();
        assert!(point.device_pointer().is_none());
        assert_eq!(tracker.host_allocated_amount(0), 64);
        assert_eq!(tracker.allocated_amount(0), 0);
        provider.free(&mut point).unwrap();
        assert_eq!(tracker.host_allocated_amount(0), 0);
    }

    #[test]
    fn double_free_is_invalid_handle() {
        let (_driver, tracker, provider) = setup();
        let mut point = AllocationPoint::new(0);
        provider
            .allocate(&AllocationShape::new(4, 4), &mut point, AllocationStatus::Device)
            .unwrap();
        provider.free(&mut point).unwrap();
        let err = provider.free(&mut point).unwrap_err();
        assert!(err.is_defect());
        assert_eq!(tracker.allocated_amount(0), 0);
    }

    #[test]
    fn out_of_memory_leaves_counters_untouched() {
        let (_driver, tracker, provider) = setup();
        let mut point = AllocationPoint::new(0);
        let err = provider
            .allocate(
                &AllocationShape::bytes(2 << 20),
                &mut point,
                AllocationStatus::Device,
            )
            .unwrap_err();
        assert!(matches!(err, MemoryError::OutOfMemory { device: 0, .. }));
        assert_eq!(tracker.allocated_amount(0), 0);
        assert_eq!(point.status(), AllocationStatus::Unallocated);
    }

    #[test]
    #[should_panic(expected = "accounting defect")]
    fn strict_double_free_is_fatal() {
        let driver = Arc::new(SimulatedDriver::new(1, 1 << 20));
        let tracker = Arc::new(MemoryTracker::new(driver.clone()).with_strict_accounting(true));
        let provider = DirectProvider::new(tracker, driver);
        let mut point = AllocationPoint::new(0);
        provider
            .allocate(&AllocationShape::new(4, 4), &mut point, AllocationStatus::Device)
            .unwrap();
        provider.free(&mut point).unwrap();
        let _ = provider.free(&mut point);
    }

    #[test]
    fn foreign_point_is_rejected() {
        let (driver, tracker, provider) = setup();
        let other = DirectProvider::new(Arc::clone(&tracker), driver.clone());
        let mut point = AllocationPoint::new(0);
        other
            .allocate(&AllocationShape::new(100, 4), &mut point, AllocationStatus::Device)
            .unwrap();

        let err = provider.free(&mut point).unwrap_err();
        assert!(matches!(err, MemoryError::InvalidHandle(_)));
        assert_eq!(point.status(), AllocationStatus::Device);
        assert_eq!(tracker.allocated_amount(0), 400);

        other.free(&mut point).unwrap();
        assert_eq!(tracker.allocated_amount(0), 0);
        assert_eq!(driver.live_allocations(0), 0);
    }

    #[test]
    fn free_releases_recorded_size_after_reshape() {
        let (_driver, tracker, provider) = setup();
        let shape = AllocationShape::new(100, 4);
        let mut a = AllocationPoint::new(0);
        let mut b = AllocationPoint::new(0);
        provider.allocate(&shape, &mut a, AllocationStatus::Device).unwrap();
        provider.allocate(&shape, &mut b, AllocationStatus::Device).unwrap();
        assert_eq!(tracker.allocated_amount(0), 800);
        assert_eq!(provider.cache_stats().issued_blocks, 2);

        a.set_shape(AllocationShape::new(10, 4));
        provider.free(&mut a).unwrap();
        assert_eq!(tracker.allocated_amount(0), 400);
        provider.free(&mut b).unwrap();
        assert_eq!(tracker.allocated_amount(0), 0);
        assert_eq!(provider.cache_stats().issued_blocks, 0);
    }

    #[test]
    fn oversized_request_is_out_of_memory() {
        let (_driver, tracker, provider) = setup();
        let mut point = AllocationPoint::new(0);
        let err = provider
            .allocate(&AllocationShape::new(u64::MAX, 1), &mut point, AllocationStatus::Device)
            .unwrap_err();
        assert!(matches!(err, MemoryError::OutOfMemory { .. }));
        assert_eq!(tracker.allocated_amount(0), 0);
    }

    #[test]
    fn unknown_device_is_invalid_handle() {
        let (_driver, _tracker, provider) = setup();
        let mut point = AllocationPoint::new(9);
        assert!(matches!(
            provider.allocate(&AllocationShape::new(1, 4), &mut point, AllocationStatus::Device),
            Err(MemoryError::InvalidHandle(_))
        ));
    }
}
