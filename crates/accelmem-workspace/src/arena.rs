//! Bump arenas over reserved provider blocks.
//!
//! A workspace reserves one block per mirrored side and hands out
//! sub-ranges of it by bumping a shared offset. Resetting the offset frees
//! every sub-range at once.

use accelmem_core::{
    AllocationPoint, AllocationShape, AllocationStatus, DeviceId, DevicePtr, HostPtr,
    MemoryError, MemoryProvider, Result,
};

/// Alignment of every sub-range handed out by a [`BumpArena`].
pub const ARENA_ALIGNMENT: u64 = 8;

/// Round `bytes` up to [`ARENA_ALIGNMENT`].
#[must_use]
pub fn align_up(bytes: u64) -> u64 {
    bytes.div_ceil(ARENA_ALIGNMENT).saturating_mul(ARENA_ALIGNMENT)
}

/// Offset bookkeeping for a fixed-capacity arena.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BumpArena {
    offset: u64,
    capacity: u64,
}

impl BumpArena {
    /// Create an arena with the given capacity in bytes.
    #[must_use]
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            offset: 0,
            capacity,
        }
    }

    /// Claim `bytes`, returning the start offset, or `None` when the
    /// remaining capacity is too small.
    pub fn alloc(&mut self, bytes: u64) -> Option<u64> {
        let start = self.offset;
        let end = start.checked_add(align_up(bytes))?;
        if end > self.capacity {
            return None;
        }
        self.offset = end;
        Some(start)
    }

    /// Reset the arena, releasing all sub-ranges at once.
    pub fn reset(&mut self) {
        self.offset = 0;
    }

    /// Replace the capacity. Only valid on a reset arena.
    pub fn resize(&mut self, capacity: u64) {
        debug_assert_eq!(self.offset, 0, "resize of a non-empty arena");
        self.capacity = capacity;
    }

    /// Bytes handed out since the last reset.
    #[must_use]
    pub fn allocated_bytes(&self) -> u64 {
        self.offset
    }

    /// Total capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes still available.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.capacity - self.offset
    }
}

/// A block reserved from a provider to back an arena.
#[derive(Debug)]
pub struct ArenaBlock {
    point: AllocationPoint,
    capacity: u64,
}

impl ArenaBlock {
    /// Reserve `capacity` bytes of device (`AllocationStatus::Device`) or
    /// pinned host (`AllocationStatus::Host`) memory.
    pub fn reserve(
        provider: &dyn MemoryProvider,
        device: DeviceId,
        capacity: u64,
        status: AllocationStatus,
    ) -> Result<Self> {
        let mut point = AllocationPoint::new(device);
        provider.allocate(&AllocationShape::bytes(capacity), &mut point, status)?;
        tracing::debug!(device, capacity, %status, "arena block reserved");
        Ok(Self { point, capacity })
    }

    /// Reserved bytes.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Device address `offset` bytes into the block.
    pub fn device_ptr_at(&self, offset: u64) -> Result<DevicePtr> {
        self.point
            .device_pointer()
            .map(|base| base.offset(offset))
            .ok_or_else(|| MemoryError::InvalidHandle("arena block has no device memory".into()))
    }

    /// Host address `offset` bytes into the block.
    pub fn host_ptr_at(&self, offset: u64) -> Result<HostPtr> {
        self.point
            .host_pointer()
            .map(|base| base.offset(offset))
            .ok_or_else(|| MemoryError::InvalidHandle("arena block has no host memory".into()))
    }

    /// Return the block to `provider`.
    pub fn release(mut self, provider: &dyn MemoryProvider) -> Result<()> {
        provider.free(&mut self.point)?;
        tracing::debug!(capacity = self.capacity, "arena block released");
        Ok(())
    }
}
