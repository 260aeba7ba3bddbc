//! Named, cycle-scoped memory arenas.

use std::fmt;
use std::sync::Arc;

use accelmem_core::{
    AllocationPoint, AllocationShape, AllocationStatus, DeviceId, MemoryError, MemoryProvider,
    MemoryTracker, PointersPair, Result, WorkspaceTag,
};

use crate::arena::{align_up, ArenaBlock, BumpArena};
use crate::configuration::{MirroringPolicy, SpillPolicy, WorkspaceConfiguration, SAFETY_OFFSET};

/// Lifecycle state of a [`Workspace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkspaceState {
    /// Reserved, never activated.
    Created,
    /// Serving buffer requests.
    Active,
    /// Scope exited; memory retained for the next cycle.
    Inactive,
    /// Terminal; all memory returned.
    Destroyed,
}

impl fmt::Display for WorkspaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Provider memory drawn for a request that did not fit in the arena.
#[derive(Debug)]
struct Spill {
    device: Option<AllocationPoint>,
    host: Option<AllocationPoint>,
    bytes: u64,
}

/// A named arena reused across repeated computations.
///
/// Buffers handed out inside a cycle are borrowed from the arena: freeing
/// them is a no-op and they become stale when the next cycle starts.
pub struct Workspace {
    name: Arc<str>,
    device: DeviceId,
    config: WorkspaceConfiguration,
    state: WorkspaceState,
    generation: u64,
    arena: BumpArena,
    device_block: Option<ArenaBlock>,
    host_block: Option<ArenaBlock>,
    spills: Vec<Spill>,
    spilled_bytes: u64,
    pending_growth: u64,
    provider: Arc<dyn MemoryProvider>,
    tracker: Arc<MemoryTracker>,
}

impl Workspace {
    /// Create a workspace on `device`, reserving
    /// [`WorkspaceConfiguration::reservation_bytes`] right away.
    pub fn new(
        name: &str,
        device: DeviceId,
        config: WorkspaceConfiguration,
        provider: Arc<dyn MemoryProvider>,
        tracker: Arc<MemoryTracker>,
    ) -> Result<Self> {
        config.validate()?;
        let mut workspace = Self {
            name: Arc::from(name),
            device,
            state: WorkspaceState::Created,
            generation: 0,
            arena: BumpArena::default(),
            device_block: None,
            host_block: None,
            spills: Vec::new(),
            spilled_bytes: 0,
            pending_growth: 0,
            provider,
            tracker,
            config,
        };
        let reservation = workspace.config.reservation_bytes();
        if reservation > 0 {
            workspace.reserve(reservation)?;
        }
        tracing::debug!(
            workspace = name,
            device,
            reservation,
            mirroring = ?workspace.config.mirroring_policy,
            "workspace created"
        );
        Ok(workspace)
    }

    /// Workspace name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device the workspace reserves memory on.
    #[must_use]
    pub fn device_id(&self) -> DeviceId {
        self.device
    }

    /// Configuration the workspace was created with.
    #[must_use]
    pub fn configuration(&self) -> &WorkspaceConfiguration {
        &self.config
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> WorkspaceState {
        self.state
    }

    /// Whether the workspace serves requests.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == WorkspaceState::Active
    }

    /// Whether the workspace has been destroyed.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.state == WorkspaceState::Destroyed
    }

    /// Cycle counter, incremented on every activation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Arena capacity in bytes (per mirrored side).
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.arena.capacity()
    }

    /// Arena bytes handed out in the current cycle.
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.arena.allocated_bytes()
    }

    /// Bytes drawn from the provider because the arena was too small, in the
    /// current cycle.
    #[must_use]
    pub fn spilled_bytes(&self) -> u64 {
        self.spilled_bytes
    }

    /// Activate the workspace. Re-entry from `Inactive` starts a new cycle.
    pub fn enter(&mut self) -> Result<()> {
        match self.state {
            WorkspaceState::Created => {}
            WorkspaceState::Inactive => self.start_cycle()?,
            WorkspaceState::Active | WorkspaceState::Destroyed => {
                return Err(MemoryError::InvalidHandle(format!(
                    "workspace '{}' is {}",
                    self.name, self.state
                )));
            }
        }
        self.generation += 1;
        self.state = WorkspaceState::Active;
        tracing::trace!(workspace = %self.name, generation = self.generation, "workspace entered");
        Ok(())
    }

    /// Deactivate the workspace, retaining its memory.
    pub fn exit(&mut self) {
        if self.state == WorkspaceState::Active {
            self.state = WorkspaceState::Inactive;
            tracing::trace!(workspace = %self.name, generation = self.generation, "workspace exited");
        }
    }

    /// Serve a buffer request from the arena, or per the spill policy when
    /// it does not fit.
    pub fn allocate(&mut self, shape: &AllocationShape) -> Result<AllocationPoint> {
        if !self.is_active() {
            return Err(MemoryError::InvalidHandle(format!(
                "workspace '{}' is {}",
                self.name, self.state
            )));
        }
        let bytes = shape.number_of_bytes();
        if bytes == 0 {
            return Err(MemoryError::InvalidRequest(
                "cannot allocate an empty shape".to_string(),
            ));
        }
        if let Some(offset) = self.arena.alloc(bytes) {
            return self.borrow_at(shape, offset);
        }
        match self.config.spill_policy {
            SpillPolicy::Fail => Err(MemoryError::WorkspaceExhausted {
                name: self.name.to_string(),
                requested: bytes,
                available: self.arena.remaining(),
            }),
            SpillPolicy::External => self.spill(shape),
            SpillPolicy::Reallocate => {
                if self.arena.allocated_bytes() == 0 {
                    let target = self.grown_capacity(align_up(bytes));
                    if target > self.arena.capacity() {
                        self.resize(target)?;
                    }
                    if let Some(offset) = self.arena.alloc(bytes) {
                        return self.borrow_at(shape, offset);
                    }
                }
                self.pending_growth = self.pending_growth.saturating_add(align_up(bytes));
                self.spill(shape)
            }
        }
    }

    /// Return everything to the provider and the tracker.
    ///
    /// Returns `Ok(false)` when the workspace was already destroyed. A failure
    /// part-way still leaves the workspace destroyed, so nothing is returned
    /// twice.
    pub fn destroy_workspace(&mut self) -> Result<bool> {
        if self.is_destroyed() {
            return Ok(false);
        }
        self.state = WorkspaceState::Destroyed;
        let spills = self.release_spills();
        let blocks = self.release_blocks();
        self.pending_growth = 0;
        tracing::debug!(workspace = %self.name, device = self.device, "workspace destroyed");
        spills.and(blocks).map(|()| true)
    }

    fn borrow_at(&self, shape: &AllocationShape, offset: u64) -> Result<AllocationPoint> {
        let host = self.block(self.host_block.as_ref())?.host_ptr_at(offset)?;
        let pointers = match self.config.mirroring_policy {
            MirroringPolicy::Full => {
                let device = self.block(self.device_block.as_ref())?.device_ptr_at(offset)?;
                PointersPair::mirrored(device, host)
            }
            MirroringPolicy::HostOnly => PointersPair::host(host),
        };
        Ok(self.tagged(shape, pointers))
    }

    fn block<'a>(&self, block: Option<&'a ArenaBlock>) -> Result<&'a ArenaBlock> {
        block.ok_or_else(|| {
            MemoryError::InvalidHandle(format!("workspace '{}' has no arena", self.name))
        })
    }

    fn tagged(&self, shape: &AllocationShape, pointers: PointersPair) -> AllocationPoint {
        let mut point = AllocationPoint::with_shape(self.device, *shape);
        point.set_pointers(pointers);
        point.set_owning_workspace(WorkspaceTag::new(Arc::clone(&self.name), self.generation));
        point
    }

    fn spill(&mut self, shape: &AllocationShape) -> Result<AllocationPoint> {
        let bytes = shape.number_of_bytes();
        let mirrored = self.config.mirroring_policy == MirroringPolicy::Full;

        let device = if mirrored {
            let mut point = AllocationPoint::new(self.device);
            self.provider
                .allocate(shape, &mut point, AllocationStatus::Device)?;
            Some(point)
        } else {
            None
        };
        let mut host = AllocationPoint::new(self.device);
        if let Err(e) = self.provider.allocate(shape, &mut host, AllocationStatus::Host) {
            if let Some(mut point) = device {
                self.provider.free(&mut point)?;
            }
            return Err(e);
        }

        if mirrored {
            self.tracker
                .increment_workspace_allocated_amount(self.device, bytes)?;
        }
        self.tracker
            .increment_workspace_host_allocated_amount(self.device, bytes)?;

        let pointers = PointersPair {
            device: device.as_ref().and_then(AllocationPoint::device_pointer),
            host: host.host_pointer(),
        };
        self.spills.push(Spill {
            device,
            host: Some(host),
            bytes,
        });
        self.spilled_bytes += bytes;
        tracing::debug!(workspace = %self.name, bytes, "request spilled to provider");
        Ok(self.tagged(shape, pointers))
    }

    fn release_spills(&mut self) -> Result<()> {
        let mut first_error = None;
        for spill in std::mem::take(&mut self.spills) {
            let mut record = |result: Result<u64>| {
                if let Err(e) = result {
                    tracing::error!(workspace = %self.name, error = %e, "failed to release spill");
                    first_error.get_or_insert(e);
                }
            };
            if let Some(mut point) = spill.device {
                record(self.provider.free(&mut point).map(|()| 0));
                record(
                    self.tracker
                        .decrement_workspace_allocated_amount(self.device, spill.bytes),
                );
            }
            if let Some(mut point) = spill.host {
                record(self.provider.free(&mut point).map(|()| 0));
                record(
                    self.tracker
                        .decrement_workspace_host_allocated_amount(self.device, spill.bytes),
                );
            }
        }
        self.spilled_bytes = 0;
        first_error.map_or(Ok(()), Err)
    }

    fn reserve(&mut self, capacity: u64) -> Result<()> {
        let device_block = match self.config.mirroring_policy {
            MirroringPolicy::Full => Some(ArenaBlock::reserve(
                self.provider.as_ref(),
                self.device,
                capacity,
                AllocationStatus::Device,
            )?),
            MirroringPolicy::HostOnly => None,
        };
        let host_block = match ArenaBlock::reserve(
            self.provider.as_ref(),
            self.device,
            capacity,
            AllocationStatus::Host,
        ) {
            Ok(block) => block,
            Err(e) => {
                if let Some(block) = device_block {
                    block.release(self.provider.as_ref())?;
                }
                return Err(e);
            }
        };

        if device_block.is_some() {
            self.tracker
                .increment_workspace_allocated_amount(self.device, capacity)?;
        }
        self.tracker
            .increment_workspace_host_allocated_amount(self.device, capacity)?;
        self.device_block = device_block;
        self.host_block = Some(host_block);
        self.arena.resize(capacity);
        Ok(())
    }

    fn release_blocks(&mut self) -> Result<()> {
        let mut result = Ok(());
        if let Some(block) = self.device_block.take() {
            let capacity = block.capacity();
            result = result
                .and(block.release(self.provider.as_ref()))
                .and(
                    self.tracker
                        .decrement_workspace_allocated_amount(self.device, capacity)
                        .map(|_| ()),
                );
        }
        if let Some(block) = self.host_block.take() {
            let capacity = block.capacity();
            result = result
                .and(block.release(self.provider.as_ref()))
                .and(
                    self.tracker
                        .decrement_workspace_host_allocated_amount(self.device, capacity)
                        .map(|_| ()),
                );
        }
        self.arena = BumpArena::default();
        result
    }

    /// Replace the arena blocks with blocks of `capacity` bytes. Only valid
    /// when nothing is borrowed from the arena in the current cycle.
    fn resize(&mut self, capacity: u64) -> Result<()> {
        let previous = self.arena.capacity();
        self.release_blocks()?;
        self.reserve(capacity)?;
        tracing::debug!(workspace = %self.name, previous, capacity, "workspace arena resized");
        Ok(())
    }

    /// Capacity after growing by `extra` bytes, capped by the max size.
    fn grown_capacity(&self, extra: u64) -> u64 {
        let current = self.arena.capacity();
        let base = if current == 0 { SAFETY_OFFSET } else { current };
        self.config.cap(base.saturating_add(extra))
    }

    fn start_cycle(&mut self) -> Result<()> {
        self.arena.reset();
        self.release_spills()?;
        if self.pending_growth > 0 {
            let target = self.grown_capacity(self.pending_growth);
            self.pending_growth = 0;
            if target > self.arena.capacity() {
                self.resize(target)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workspace")
            .field("name", &self.name)
            .field("device", &self.device)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("capacity", &self.arena.capacity())
            .field("used", &self.arena.allocated_bytes())
            .field("spilled", &self.spilled_bytes)
            .finish_non_exhaustive()
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_workspace() {
            tracing::warn!(workspace = %self.name, error = %e, "failed to destroy workspace on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accelmem_core::{build_provider, CacheConfig, MemoryDriver, ProviderKind, SimulatedDriver};

    use crate::configuration::AllocationPolicy;

    fn setup(kind: ProviderKind) -> (Arc<dyn MemoryProvider>, Arc<MemoryTracker>) {
        let driver: Arc<dyn MemoryDriver> = Arc::new(SimulatedDriver::new(1, 1 << 24));
        let tracker = Arc::new(MemoryTracker::new(Arc::clone(&driver)));
        let provider = build_provider(kind, Arc::clone(&tracker), driver, &CacheConfig::default());
        (provider, tracker)
    }

    fn workspace(config: WorkspaceConfiguration) -> (Workspace, Arc<MemoryTracker>) {
        let (provider, tracker) = setup(ProviderKind::Direct);
        let ws = Workspace::new("test", 0, config, provider, Arc::clone(&tracker)).unwrap();
        (ws, tracker)
    }

    fn f32s(n: u64) -> AllocationShape {
        AllocationShape::new(n, 4)
    }

    #[test]
    fn reservation_is_tracked_per_side() {
        let config = WorkspaceConfiguration::builder().initial_size(1024).build();
        let (mut ws, tracker) = workspace(config);
        assert_eq!(ws.state(), WorkspaceState::Created);
        assert_eq!(tracker.workspace_allocated_amount(0), 2048);
        assert_eq!(tracker.workspace_host_allocated_amount(0), 2048);
        assert_eq!(tracker.allocated_amount(0), 2048);

        assert!(ws.destroy_workspace().unwrap());
        assert_eq!(tracker.workspace_allocated_amount(0), 0);
        assert_eq!(tracker.workspace_host_allocated_amount(0), 0);
        assert_eq!(tracker.allocated_amount(0), 0);
    }

    #[test]
    fn borrowed_buffers_are_mirrored_and_tagged() {
        let config = WorkspaceConfiguration::builder().initial_size(256).build();
        let (mut ws, _tracker) = workspace(config);
        ws.enter().unwrap();
        let a = ws.allocate(&f32s(4)).unwrap();
        let b = ws.allocate(&f32s(4)).unwrap();
        assert!(a.is_borrowed());
        assert!(a.device_pointer().is_some());
        assert!(a.host_pointer().is_some());
        assert_eq!(
            b.device_pointer().unwrap().address() - a.device_pointer().unwrap().address(),
            16
        );
        assert_eq!(a.owning_workspace().unwrap().name(), "test");
        assert_eq!(a.owning_workspace().unwrap().generation(), 1);
        assert_eq!(ws.used_bytes(), 32);
    }

    #[test]
    fn host_only_never_touches_device_counter() {
        let config = WorkspaceConfiguration::builder()
            .initial_size(512)
            .policy_mirroring(MirroringPolicy::HostOnly)
            .build();
        let (mut ws, tracker) = workspace(config);
        ws.enter().unwrap();
        let point = ws.allocate(&f32s(4)).unwrap();
        assert!(point.device_pointer().is_none());
        assert_eq!(point.status(), AllocationStatus::Host);
        assert_eq!(tracker.workspace_allocated_amount(0), 0);
        assert_eq!(tracker.workspace_host_allocated_amount(0), 512 + SAFETY_OFFSET);
    }

    #[test]
    fn external_spill_is_attributed() {
        let (mut ws, tracker) = workspace(WorkspaceConfiguration::default());
        ws.enter().unwrap();
        let point = ws.allocate(&f32s(4)).unwrap();
        assert!(point.is_borrowed());
        assert_eq!(tracker.workspace_allocated_amount(0), 16);
        assert_eq!(tracker.workspace_host_allocated_amount(0), 16);
        assert_eq!(ws.spilled_bytes(), 16);

        ws.exit();
        assert_eq!(tracker.workspace_allocated_amount(0), 16);
        ws.enter().unwrap();
        assert_eq!(ws.spilled_bytes(), 0);
        assert_eq!(tracker.workspace_allocated_amount(0), 0);
        assert_eq!(tracker.allocated_amount(0), 0);
    }

    #[test]
    fn fail_policy_reports_exhaustion() {
        let config = WorkspaceConfiguration::builder()
            .initial_size(8)
            .policy_spill(SpillPolicy::Fail)
            .build();
        let (mut ws, tracker) = workspace(config);
        ws.enter().unwrap();
        let err = ws.allocate(&f32s(1024)).unwrap_err();
        match err {
            MemoryError::WorkspaceExhausted {
                requested,
                available,
                ..
            } => {
                assert_eq!(requested, 4096);
                assert_eq!(available, 8 + SAFETY_OFFSET);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(tracker.workspace_allocated_amount(0), 8 + SAFETY_OFFSET);
    }

    #[test]
    fn reallocate_grows_empty_arena() {
        let config = WorkspaceConfiguration::builder()
            .policy_spill(SpillPolicy::Reallocate)
            .build();
        let (mut ws, tracker) = workspace(config);
        ws.enter().unwrap();
        let point = ws.allocate(&f32s(100)).unwrap();
        assert_eq!(ws.spilled_bytes(), 0);
        assert_eq!(ws.capacity(), SAFETY_OFFSET + 400);
        assert_eq!(ws.used_bytes(), 400);
        assert!(point.is_borrowed());
        assert_eq!(tracker.workspace_allocated_amount(0), SAFETY_OFFSET + 400);
    }

    #[test]
    fn reallocate_defers_growth_while_borrowed() {
        let config = WorkspaceConfiguration::builder()
            .initial_size(64)
            .policy_spill(SpillPolicy::Reallocate)
            .build();
        let (mut ws, tracker) = workspace(config);
        ws.enter().unwrap();
        ws.allocate(&f32s(16)).unwrap();
        ws.allocate(&f32s(1024)).unwrap();
        assert_eq!(ws.spilled_bytes(), 4096);
        assert_eq!(ws.capacity(), 64 + SAFETY_OFFSET);

        ws.exit();
        ws.enter().unwrap();
        assert_eq!(ws.capacity(), 64 + SAFETY_OFFSET + 4096);
        assert_eq!(ws.spilled_bytes(), 0);
        assert_eq!(
            tracker.workspace_allocated_amount(0),
            64 + SAFETY_OFFSET + 4096
        );
        ws.allocate(&f32s(1024)).unwrap();
        assert_eq!(ws.spilled_bytes(), 0);
    }

    #[test]
    fn growth_respects_max_size() {
        let config = WorkspaceConfiguration::builder()
            .policy_spill(SpillPolicy::Reallocate)
            .max_size(2048)
            .build();
        let (mut ws, _tracker) = workspace(config);
        ws.enter().unwrap();
        ws.allocate(&f32s(2048)).unwrap();
        assert_eq!(ws.capacity(), 2048);
        assert_eq!(ws.spilled_bytes(), 8192);
    }

    #[test]
    fn reentry_starts_a_new_cycle() {
        let config = WorkspaceConfiguration::builder().initial_size(64).build();
        let (mut ws, _tracker) = workspace(config);
        ws.enter().unwrap();
        let first = ws.allocate(&f32s(8)).unwrap();
        ws.exit();
        assert_eq!(ws.state(), WorkspaceState::Inactive);
        ws.enter().unwrap();
        assert_eq!(ws.generation(), 2);
        assert_eq!(ws.used_bytes(), 0);
        let second = ws.allocate(&f32s(8)).unwrap();
        assert_eq!(first.device_pointer(), second.device_pointer());
    }

    #[test]
    fn state_errors() {
        let (mut ws, _tracker) = workspace(WorkspaceConfiguration::default());
        assert!(matches!(
            ws.allocate(&f32s(1)),
            Err(MemoryError::InvalidHandle(_))
        ));
        ws.enter().unwrap();
        assert!(ws.enter().is_err());
        assert!(matches!(
            ws.allocate(&f32s(0)),
            Err(MemoryError::InvalidRequest(_))
        ));
        assert!(ws.destroy_workspace().unwrap());
        assert!(ws.enter().is_err());
    }

    #[test]
    fn double_destroy_is_a_no_op() {
        let config = WorkspaceConfiguration::builder().initial_size(1024).build();
        let (mut ws, tracker) = workspace(config);
        ws.enter().unwrap();
        ws.allocate(&f32s(4096)).unwrap();
        assert!(ws.destroy_workspace().unwrap());
        assert!(!ws.destroy_workspace().unwrap());
        assert_eq!(tracker.workspace_allocated_amount(0), 0);
        assert_eq!(tracker.workspace_host_allocated_amount(0), 0);
    }

    #[test]
    fn drop_destroys() {
        let (provider, tracker) = setup(ProviderKind::FullCaching);
        let config = WorkspaceConfiguration::builder()
            .policy_allocation(AllocationPolicy::Overallocate)
            .initial_size(1000)
            .build();
        let ws = Workspace::new("dropped", 0, config, provider, Arc::clone(&tracker)).unwrap();
        assert!(tracker.workspace_allocated_amount(0) > 0);
        drop(ws);
        assert_eq!(tracker.workspace_allocated_amount(0), 0);
        assert_eq!(tracker.allocated_amount(0), 0);
        assert!(tracker.cached_amount(0) > 0);
    }
}
