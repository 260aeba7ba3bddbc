//! Hardware driver seam and an in-process simulated driver.
//!
//! Providers never talk to hardware directly; they go through
//! [`MemoryDriver`], which exposes raw per-device allocate/free of device
//! memory and pinned host memory plus total/free memory queries.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::DriverError;

/// Accelerator index.
pub type DeviceId = usize;

/// Alignment applied by [`SimulatedDriver`] to every raw allocation.
pub const DRIVER_ALIGNMENT: u64 = 256;

/// Opaque device-memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(u64);

/// Opaque pinned host-memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostPtr(u64);

macro_rules! impl_address {
    ($ty:ident) => {
        impl $ty {
            /// Wrap a raw address.
            #[must_use]
            pub const fn new(address: u64) -> Self {
                Self(address)
            }

            /// Raw address value.
            #[must_use]
            pub const fn address(self) -> u64 {
                self.0
            }

            /// Address `bytes` past this one (sub-range of a reserved block).
            #[must_use]
            pub const fn offset(self, bytes: u64) -> Self {
                Self(self.0 + bytes)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }
    };
}

impl_address!(DevicePtr);
impl_address!(HostPtr);

/// Raw memory operations offered by the hardware driver.
pub trait MemoryDriver: Send + Sync {
    /// Number of addressable devices.
    fn device_count(&self) -> usize;

    /// Allocate `bytes` of device memory.
    fn malloc_device(&self, device: DeviceId, bytes: u64) -> Result<DevicePtr, DriverError>;

    /// Release device memory previously returned by `malloc_device`.
    fn free_device(&self, device: DeviceId, ptr: DevicePtr) -> Result<(), DriverError>;

    /// Allocate `bytes` of pinned host memory associated with `device`.
    fn malloc_pinned(&self, device: DeviceId, bytes: u64) -> Result<HostPtr, DriverError>;

    /// Release pinned host memory previously returned by `malloc_pinned`.
    fn free_pinned(&self, device: DeviceId, ptr: HostPtr) -> Result<(), DriverError>;

    /// Total memory of the device in bytes.
    fn total_memory(&self, device: DeviceId) -> Result<u64, DriverError>;

    /// Free memory of the device in bytes, as reported by the hardware.
    fn free_memory(&self, device: DeviceId) -> Result<u64, DriverError>;
}

/// Hardware call counters of a [`SimulatedDriver`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HardwareCalls {
    /// Successful allocation calls (device and pinned).
    pub mallocs: u64,
    /// Successful release calls (device and pinned).
    pub frees: u64,
}

struct MemoryPool {
    capacity: u64,
    used: u64,
    live: HashMap<u64, u64>,
}

impl MemoryPool {
    fn new(capacity: u64) -> Self {
        Self {
            capacity,
            used: 0,
            live: HashMap::new(),
        }
    }

    fn alloc(&mut self, device: DeviceId, bytes: u64, next: &AtomicU64) -> Result<u64, DriverError> {
        let available = self.capacity - self.used;
        let aligned = match align(bytes) {
            Some(aligned) if aligned <= available => aligned,
            aligned => {
                return Err(DriverError::OutOfMemory {
                    device,
                    requested: aligned.unwrap_or(bytes),
                    available,
                });
            }
        };
        let address = next.fetch_add(aligned.saturating_add(DRIVER_ALIGNMENT), Ordering::Relaxed);
        self.used += aligned;
        self.live.insert(address, aligned);
        Ok(address)
    }

    fn free(&mut self, device: DeviceId, address: u64) -> Result<(), DriverError> {
        let size = self
            .live
            .remove(&address)
            .ok_or(DriverError::UnknownPointer { device, address })?;
        self.used -= size;
        Ok(())
    }
}

/// Round a raw request up to the driver alignment (at least one unit).
/// `None` when the rounded size does not fit in `u64`.
fn align(bytes: u64) -> Option<u64> {
    bytes.max(1).checked_next_multiple_of(DRIVER_ALIGNMENT)
}

/// In-process driver with fixed per-device capacity.
///
/// Addresses are unique for the lifetime of the driver. Frees of unknown or
/// already-freed addresses are rejected.
pub struct SimulatedDriver {
    devices: Vec<Mutex<MemoryPool>>,
    pinned: Vec<Mutex<MemoryPool>>,
    next_address: AtomicU64,
    mallocs: AtomicU64,
    frees: AtomicU64,
    fail_queries: AtomicBool,
}

impl SimulatedDriver {
    /// Create a driver with `device_count` devices of `device_capacity` bytes
    /// each. Every device gets a pinned host pool of the same size.
    #[must_use]
    pub fn new(device_count: usize, device_capacity: u64) -> Self {
        Self {
            devices: (0..device_count)
                .map(|_| Mutex::new(MemoryPool::new(device_capacity)))
                .collect(),
            pinned: (0..device_count)
                .map(|_| Mutex::new(MemoryPool::new(device_capacity)))
                .collect(),
            next_address: AtomicU64::new(0x1_0000),
            mallocs: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            fail_queries: AtomicBool::new(false),
        }
    }

    /// Override the pinned host pool size of every device.
    #[must_use]
    pub fn with_pinned_capacity(self, bytes: u64) -> Self {
        for pool in &self.pinned {
            pool.lock().capacity = bytes;
        }
        self
    }

    /// Make `total_memory`/`free_memory` fail until reset.
    pub fn set_query_failure(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::Relaxed);
    }

    /// Snapshot of the hardware call counters.
    #[must_use]
    pub fn hardware_calls(&self) -> HardwareCalls {
        HardwareCalls {
            mallocs: self.mallocs.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
        }
    }

    /// Number of live device and pinned allocations on `device`.
    #[must_use]
    pub fn live_allocations(&self, device: DeviceId) -> usize {
        let device_live = self.devices.get(device).map_or(0, |p| p.lock().live.len());
        let pinned_live = self.pinned.get(device).map_or(0, |p| p.lock().live.len());
        device_live + pinned_live
    }

    fn pool(pools: &[Mutex<MemoryPool>], device: DeviceId) -> Result<&Mutex<MemoryPool>, DriverError> {
        pools.get(device).ok_or(DriverError::InvalidDevice(device))
    }

    fn check_query(&self, device: DeviceId) -> Result<(), DriverError> {
        if self.fail_queries.load(Ordering::Relaxed) {
            return Err(DriverError::QueryFailed {
                device,
                reason: "driver query failure injected".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new(1, 4 * 1024 * 1024 * 1024)
    }
}

impl MemoryDriver for SimulatedDriver {
    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn malloc_device(&self, device: DeviceId, bytes: u64) -> Result<DevicePtr, DriverError> {
        let address = Self::pool(&self.devices, device)?
            .lock()
            .alloc(device, bytes, &self.next_address)?;
        self.mallocs.fetch_add(1, Ordering::Relaxed);
        Ok(DevicePtr(address))
    }

    fn free_device(&self, device: DeviceId, ptr: DevicePtr) -> Result<(), DriverError> {
        Self::pool(&self.devices, device)?
            .lock()
            .free(device, ptr.0)?;
        self.frees.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn malloc_pinned(&self, device: DeviceId, bytes: u64) -> Result<HostPtr, DriverError> {
        let address = Self::pool(&self.pinned, device)?
            .lock()
            .alloc(device, bytes, &self.next_address)?;
        self.mallocs.fetch_add(1, Ordering::Relaxed);
        Ok(HostPtr(address))
    }

    fn free_pinned(&self, device: DeviceId, ptr: HostPtr) -> Result<(), DriverError> {
        Self::pool(&self.pinned, device)?
            .lock()
            .free(device, ptr.0)?;
        self.frees.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn total_memory(&self, device: DeviceId) -> Result<u64, DriverError> {
        let pool = Self::pool(&self.devices, device)?;
        self.check_query(device)?;
        Ok(pool.lock().capacity)
    }

    fn free_memory(&self, device: DeviceId) -> Result<u64, DriverError> {
        let pool = Self::pool(&self.devices, device)?;
        self.check_query(device)?;
        let pool = pool.lock();
        Ok(pool.capacity - pool.used)
    }
}
