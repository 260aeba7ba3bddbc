//! Allocation points: the unit of bookkeeping.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::device::{DeviceId, DevicePtr, HostPtr};
use crate::shape::AllocationShape;

static NEXT_POINT_ID: AtomicU64 = AtomicU64::new(1);

/// Where (if anywhere) the memory of a point lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationStatus {
    /// Nothing allocated yet.
    Unallocated,
    /// Device memory (possibly with a host mirror).
    Device,
    /// Pinned host memory only.
    Host,
    /// Released; the record must not be reused.
    Deallocated,
}

impl fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unallocated => "unallocated",
            Self::Device => "device",
            Self::Host => "host",
            Self::Deallocated => "deallocated",
        };
        f.write_str(name)
    }
}

/// Device and host pointers returned by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PointersPair {
    /// Device-side address.
    pub device: Option<DevicePtr>,
    /// Host-side address.
    pub host: Option<HostPtr>,
}

impl PointersPair {
    /// Device pointer only.
    #[must_use]
    pub const fn device(ptr: DevicePtr) -> Self {
        Self {
            device: Some(ptr),
            host: None,
        }
    }

    /// Host pointer only.
    #[must_use]
    pub const fn host(ptr: HostPtr) -> Self {
        Self {
            device: None,
            host: Some(ptr),
        }
    }

    /// Both sides.
    #[must_use]
    pub const fn mirrored(device: DevicePtr, host: HostPtr) -> Self {
        Self {
            device: Some(device),
            host: Some(host),
        }
    }

    /// Whether neither pointer is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.device.is_none() && self.host.is_none()
    }
}

/// Weak reference to the workspace cycle a buffer was borrowed from.
///
/// Holding a tag never keeps the workspace alive; the generation tells
/// whether the arena has since been reset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkspaceTag {
    name: Arc<str>,
    generation: u64,
}

impl WorkspaceTag {
    /// Tag for cycle `generation` of workspace `name`.
    #[must_use]
    pub fn new(name: Arc<str>, generation: u64) -> Self {
        Self { name, generation }
    }

    /// Workspace name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Workspace cycle the buffer belongs to.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }
}

/// Bookkeeping record for one buffer.
///
/// Constructed empty, then given a shape, then filled in by a provider.
/// Deliberately not `Clone`: the record owns its pointers.
#[derive(Debug)]
pub struct AllocationPoint {
    id: u64,
    device: DeviceId,
    shape: Option<AllocationShape>,
    status: AllocationStatus,
    pointers: PointersPair,
    workspace: Option<WorkspaceTag>,
}

impl AllocationPoint {
    /// Empty point bound to `device`.
    #[must_use]
    pub fn new(device: DeviceId) -> Self {
        Self {
            id: NEXT_POINT_ID.fetch_add(1, Ordering::Relaxed),
            device,
            shape: None,
            status: AllocationStatus::Unallocated,
            pointers: PointersPair::default(),
            workspace: None,
        }
    }

    /// Empty point with its shape already set.
    #[must_use]
    pub fn with_shape(device: DeviceId, shape: AllocationShape) -> Self {
        let mut point = Self::new(device);
        point.set_shape(shape);
        point
    }

    /// Process-unique identifier.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Device this point is bound to.
    #[must_use]
    pub const fn device_id(&self) -> DeviceId {
        self.device
    }

    /// Shape, once set.
    #[must_use]
    pub const fn shape(&self) -> Option<&AllocationShape> {
        self.shape.as_ref()
    }

    /// Set the shape.
    pub fn set_shape(&mut self, shape: AllocationShape) {
        self.shape = Some(shape);
    }

    /// Size in bytes according to the shape (0 when unset).
    #[must_use]
    pub fn number_of_bytes(&self) -> u64 {
        self.shape.map_or(0, |s| s.number_of_bytes())
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> AllocationStatus {
        self.status
    }

    /// Whether the point currently owns memory.
    #[must_use]
    pub const fn is_allocated(&self) -> bool {
        matches!(self.status, AllocationStatus::Device | AllocationStatus::Host)
    }

    /// Pointers currently held.
    #[must_use]
    pub const fn pointers(&self) -> PointersPair {
        self.pointers
    }

    /// Device pointer, if any.
    #[must_use]
    pub const fn device_pointer(&self) -> Option<DevicePtr> {
        self.pointers.device
    }

    /// Host pointer, if any.
    #[must_use]
    pub const fn host_pointer(&self) -> Option<HostPtr> {
        self.pointers.host
    }

    /// Store the pointers returned by a provider. The status follows the
    /// pointers: a device pointer means `Device`, a host pointer alone `Host`.
    pub fn set_pointers(&mut self, pointers: PointersPair) {
        self.pointers = pointers;
        self.status = if pointers.device.is_some() {
            AllocationStatus::Device
        } else if pointers.host.is_some() {
            AllocationStatus::Host
        } else {
            self.status
        };
    }

    /// Workspace this buffer was borrowed from, if any.
    #[must_use]
    pub const fn owning_workspace(&self) -> Option<&WorkspaceTag> {
        self.workspace.as_ref()
    }

    /// Mark the point as borrowed from a workspace cycle.
    pub fn set_owning_workspace(&mut self, tag: WorkspaceTag) {
        self.workspace = Some(tag);
    }

    /// Whether the memory belongs to a workspace rather than the point.
    #[must_use]
    pub const fn is_borrowed(&self) -> bool {
        self.workspace.is_some()
    }

    /// Drop the pointers and move to `Deallocated`.
    pub fn mark_deallocated(&mut self) {
        self.pointers = PointersPair::default();
        self.status = AllocationStatus::Deallocated;
    }
}
