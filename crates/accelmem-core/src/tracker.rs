//! Per-device memory accounting.
//!
//! `MemoryTracker` holds lock-free atomic counters for every device. All
//! mutators are single atomic read-modify-write operations, so concurrent
//! increments and decrements from different threads never lose an update.
//! A decrement that would take a counter below zero is rejected with
//! [`MemoryError::CounterUnderflow`] and leaves the counter unchanged.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::device::{DeviceId, MemoryDriver};
use crate::error::{MemoryError, Result};

/// Identifies one of the per-device counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterKind {
    /// Device bytes handed out to callers.
    Allocated,
    /// Device bytes retained in a provider cache.
    Cached,
    /// Pinned host bytes handed out to callers.
    HostAllocated,
    /// Pinned host bytes retained in a provider cache.
    HostCached,
    /// Device bytes attributed to workspaces (arenas and spills).
    WorkspaceAllocated,
    /// Host bytes attributed to mirrored or host-only workspaces.
    WorkspaceHostAllocated,
}

impl CounterKind {
    /// All counters, in storage order.
    pub const ALL: [Self; 6] = [
        Self::Allocated,
        Self::Cached,
        Self::HostAllocated,
        Self::HostCached,
        Self::WorkspaceAllocated,
        Self::WorkspaceHostAllocated,
    ];

    const fn index(self) -> usize {
        self as usize
    }

    /// Human-readable counter name.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Allocated => "allocated",
            Self::Cached => "cached",
            Self::HostAllocated => "host allocated",
            Self::HostCached => "host cached",
            Self::WorkspaceAllocated => "workspace allocated",
            Self::WorkspaceHostAllocated => "workspace host allocated",
        }
    }
}

impl fmt::Display for CounterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Point-in-time copy of one device's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    /// Device the snapshot was taken from.
    pub device: DeviceId,
    /// Device bytes handed out.
    pub allocated: u64,
    /// Device bytes cached.
    pub cached: u64,
    /// Host bytes handed out.
    pub host_allocated: u64,
    /// Host bytes cached.
    pub host_cached: u64,
    /// Device bytes attributed to workspaces.
    pub workspace_allocated: u64,
    /// Host bytes attributed to workspaces.
    pub workspace_host_allocated: u64,
}

#[derive(Default)]
struct DeviceCounters {
    values: [AtomicU64; 6],
    total_memory: AtomicU64,
}

/// Process-wide accounting service.
///
/// Create one per runtime and share it as `Arc<MemoryTracker>`; tests build
/// isolated instances.
pub struct MemoryTracker {
    devices: Vec<DeviceCounters>,
    driver: Arc<dyn MemoryDriver>,
    strict_accounting: bool,
}

impl MemoryTracker {
    /// Create a tracker with zeroed counters for every device of `driver`.
    #[must_use]
    pub fn new(driver: Arc<dyn MemoryDriver>) -> Self {
        let devices = (0..driver.device_count())
            .map(|_| DeviceCounters::default())
            .collect();
        Self {
            devices,
            driver,
            strict_accounting: false,
        }
    }

    /// Panic on accounting defects (counter underflow, invalid handles on
    /// release) instead of returning them.
    #[must_use]
    pub fn with_strict_accounting(mut self, strict: bool) -> Self {
        self.strict_accounting = strict;
        self
    }

    /// Whether accounting defects are fatal.
    #[must_use]
    pub fn is_strict(&self) -> bool {
        self.strict_accounting
    }

    /// Hand `err` back to the caller. Under strict accounting a defect
    /// aborts the caller instead.
    pub fn defect(&self, err: MemoryError) -> MemoryError {
        if self.strict_accounting && err.is_defect() {
            panic!("accounting defect: {err}");
        }
        err
    }

    /// Number of tracked devices.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn counters(&self, device: DeviceId) -> Result<&DeviceCounters> {
        self.devices
            .get(device)
            .ok_or_else(|| MemoryError::InvalidHandle(format!("unknown device {device}")))
    }

    /// Add `bytes` to a counter, returning the new value.
    pub fn increment(&self, kind: CounterKind, device: DeviceId, bytes: u64) -> Result<u64> {
        let previous = self.counters(device)?.values[kind.index()].fetch_add(bytes, Ordering::AcqRel);
        tracing::trace!(device, counter = %kind, bytes, "counter incremented");
        Ok(previous + bytes)
    }

    /// Subtract `bytes` from a counter, returning the new value.
    ///
    /// Fails with `CounterUnderflow` instead of going below zero.
    pub fn decrement(&self, kind: CounterKind, device: DeviceId, bytes: u64) -> Result<u64> {
        let counter = &self.counters(device)?.values[kind.index()];
        match counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            current.checked_sub(bytes)
        }) {
            Ok(previous) => {
                tracing::trace!(device, counter = %kind, bytes, "counter decremented");
                Ok(previous - bytes)
            }
            Err(current) => {
                tracing::error!(
                    device,
                    counter = %kind,
                    current,
                    bytes,
                    "counter underflow rejected"
                );
                Err(self.defect(MemoryError::CounterUnderflow {
                    device,
                    counter: kind,
                    current,
                    amount: bytes,
                }))
            }
        }
    }

    /// Current value of a counter; unknown devices read 0.
    #[must_use]
    pub fn get(&self, kind: CounterKind, device: DeviceId) -> u64 {
        self.devices
            .get(device)
            .map_or(0, |c| c.values[kind.index()].load(Ordering::Acquire))
    }

    /// Sum of a counter over all devices.
    #[must_use]
    pub fn total(&self, kind: CounterKind) -> u64 {
        self.devices
            .iter()
            .map(|c| c.values[kind.index()].load(Ordering::Acquire))
            .sum()
    }

    /// Add to the allocated device bytes.
    pub fn increment_allocated_amount(&self, device: DeviceId, bytes: u64) -> Result<u64> {
        self.increment(CounterKind::Allocated, device, bytes)
    }

    /// Subtract from the allocated device bytes.
    pub fn decrement_allocated_amount(&self, device: DeviceId, bytes: u64) -> Result<u64> {
        self.decrement(CounterKind::Allocated, device, bytes)
    }

    /// Add to the cached device bytes.
    pub fn increment_cached_amount(&self, device: DeviceId, bytes: u64) -> Result<u64> {
        self.increment(CounterKind::Cached, device, bytes)
    }

    /// Subtract from the cached device bytes.
    pub fn decrement_cached_amount(&self, device: DeviceId, bytes: u64) -> Result<u64> {
        self.decrement(CounterKind::Cached, device, bytes)
    }

    /// Add to the allocated pinned host bytes.
    pub fn increment_host_allocated_amount(&self, device: DeviceId, bytes: u64) -> Result<u64> {
        self.increment(CounterKind::HostAllocated, device, bytes)
    }

    /// Subtract from the allocated pinned host bytes.
    pub fn decrement_host_allocated_amount(&self, device: DeviceId, bytes: u64) -> Result<u64> {
        self.decrement(CounterKind::HostAllocated, device, bytes)
    }

    /// Add to the cached pinned host bytes.
    pub fn increment_host_cached_amount(&self, device: DeviceId, bytes: u64) -> Result<u64> {
        self.increment(CounterKind::HostCached, device, bytes)
    }

    /// Subtract from the cached pinned host bytes.
    pub fn decrement_host_cached_amount(&self, device: DeviceId, bytes: u64) -> Result<u64> {
        self.decrement(CounterKind::HostCached, device, bytes)
    }

    /// Add to the device bytes attributed to workspaces.
    pub fn increment_workspace_allocated_amount(&self, device: DeviceId, bytes: u64) -> Result<u64> {
        self.increment(CounterKind::WorkspaceAllocated, device, bytes)
    }

    /// Subtract from the device bytes attributed to workspaces.
    pub fn decrement_workspace_allocated_amount(&self, device: DeviceId, bytes: u64) -> Result<u64> {
        self.decrement(CounterKind::WorkspaceAllocated, device, bytes)
    }

    /// Add to the host bytes attributed to workspaces.
    pub fn increment_workspace_host_allocated_amount(
        &self,
        device: DeviceId,
        bytes: u64,
    ) -> Result<u64> {
        self.increment(CounterKind::WorkspaceHostAllocated, device, bytes)
    }

    /// Subtract from the host bytes attributed to workspaces.
    pub fn decrement_workspace_host_allocated_amount(
        &self,
        device: DeviceId,
        bytes: u64,
    ) -> Result<u64> {
        self.decrement(CounterKind::WorkspaceHostAllocated, device, bytes)
    }

    /// Allocated device bytes.
    #[must_use]
    pub fn allocated_amount(&self, device: DeviceId) -> u64 {
        self.get(CounterKind::Allocated, device)
    }

    /// Cached device bytes.
    #[must_use]
    pub fn cached_amount(&self, device: DeviceId) -> u64 {
        self.get(CounterKind::Cached, device)
    }

    /// Allocated pinned host bytes for `device`.
    #[must_use]
    pub fn host_allocated_amount(&self, device: DeviceId) -> u64 {
        self.get(CounterKind::HostAllocated, device)
    }

    /// Cached pinned host bytes for `device`.
    #[must_use]
    pub fn host_cached_amount(&self, device: DeviceId) -> u64 {
        self.get(CounterKind::HostCached, device)
    }

    /// Allocated pinned host bytes over all devices.
    #[must_use]
    pub fn allocated_host_amount(&self) -> u64 {
        self.total(CounterKind::HostAllocated)
    }

    /// Cached pinned host bytes over all devices.
    #[must_use]
    pub fn cached_host_amount(&self) -> u64 {
        self.total(CounterKind::HostCached)
    }

    /// Device bytes attributed to workspaces.
    #[must_use]
    pub fn workspace_allocated_amount(&self, device: DeviceId) -> u64 {
        self.get(CounterKind::WorkspaceAllocated, device)
    }

    /// Host bytes attributed to workspaces.
    #[must_use]
    pub fn workspace_host_allocated_amount(&self, device: DeviceId) -> u64 {
        self.get(CounterKind::WorkspaceHostAllocated, device)
    }

    /// Total device memory. The first successful answer is cached; failures
    /// are returned as-is and never cached.
    pub fn total_memory(&self, device: DeviceId) -> Result<u64> {
        let counters = self.counters(device)?;
        let cached = counters.total_memory.load(Ordering::Acquire);
        if cached != 0 {
            return Ok(cached);
        }
        let total = self.driver.total_memory(device)?;
        counters.total_memory.store(total, Ordering::Release);
        Ok(total)
    }

    /// Cheap estimate of free device memory: total minus allocated.
    pub fn approximate_free_memory(&self, device: DeviceId) -> Result<u64> {
        let total = self.total_memory(device)?;
        Ok(total.saturating_sub(self.allocated_amount(device)))
    }

    /// Free device memory as reported by the hardware.
    pub fn precise_free_memory(&self, device: DeviceId) -> Result<u64> {
        self.counters(device)?;
        Ok(self.driver.free_memory(device)?)
    }

    /// Copy of every counter of `device`.
    #[must_use]
    pub fn snapshot(&self, device: DeviceId) -> CounterSnapshot {
        CounterSnapshot {
            device,
            allocated: self.get(CounterKind::Allocated, device),
            cached: self.get(CounterKind::Cached, device),
            host_allocated: self.get(CounterKind::HostAllocated, device),
            host_cached: self.get(CounterKind::HostCached, device),
            workspace_allocated: self.get(CounterKind::WorkspaceAllocated, device),
            workspace_host_allocated: self.get(CounterKind::WorkspaceHostAllocated, device),
        }
    }
}

impl fmt::Debug for MemoryTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshots: Vec<CounterSnapshot> =
            (0..self.devices.len()).map(|d| self.snapshot(d)).collect();
        f.debug_struct("MemoryTracker")
            .field("devices", &snapshots)
            .finish_non_exhaustive()
    }
}
