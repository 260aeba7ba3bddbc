//! Error types for drivers, providers and the tracker.

use crate::device::DeviceId;
use crate::tracker::CounterKind;

/// Errors reported by a [`MemoryDriver`](crate::device::MemoryDriver).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    /// The device (or its pinned host pool) cannot satisfy the request.
    #[error("device {device} out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        /// Device the request was made against.
        device: DeviceId,
        /// Bytes requested from the driver (after alignment).
        requested: u64,
        /// Bytes still available on the device.
        available: u64,
    },

    /// No such device.
    #[error("invalid device id {0}")]
    InvalidDevice(DeviceId),

    /// The address was never handed out by the driver, or was already freed.
    #[error("unknown pointer {address:#x} on device {device}")]
    UnknownPointer {
        /// Device the release was made against.
        device: DeviceId,
        /// Offending address.
        address: u64,
    },

    /// A memory query failed at the driver level.
    #[error("memory query failed on device {device}: {reason}")]
    QueryFailed {
        /// Device that was queried.
        device: DeviceId,
        /// Driver-provided reason.
        reason: String,
    },
}

/// Error type for the memory subsystem.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Hardware exhausted and no cached block satisfies the request.
    #[error("out of memory on device {device}: {requested} bytes requested")]
    OutOfMemory {
        /// Device the request was made against.
        device: DeviceId,
        /// Bytes requested by the caller.
        requested: u64,
        /// Underlying driver failure.
        #[source]
        source: DriverError,
    },

    /// Operation on an unknown, unallocated, already-freed or borrowed handle.
    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    /// A decrement would take a tracker counter below zero.
    #[error("counter underflow: {counter} on device {device} holds {current}, cannot subtract {amount}")]
    CounterUnderflow {
        /// Device whose counter was decremented.
        device: DeviceId,
        /// Counter that would underflow.
        counter: CounterKind,
        /// Value held before the rejected decrement.
        current: u64,
        /// Rejected decrement.
        amount: u64,
    },

    /// A total/free memory query failed at the driver.
    #[error("hardware query failed on device {device}")]
    HardwareQuery {
        /// Device that was queried.
        device: DeviceId,
        /// Underlying driver failure.
        #[source]
        source: DriverError,
    },

    /// A workspace with the `Fail` spill policy ran out of arena space.
    #[error("workspace '{name}' exhausted: requested {requested} bytes, {available} available")]
    WorkspaceExhausted {
        /// Workspace name.
        name: String,
        /// Bytes requested.
        requested: u64,
        /// Bytes left in the arena.
        available: u64,
    },

    /// The request itself is malformed (empty shape, non-allocating status).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl MemoryError {
    /// Whether this error indicates a bug in the caller or in the accounting
    /// rather than a legitimate runtime condition.
    #[must_use]
    pub fn is_defect(&self) -> bool {
        matches!(
            self,
            Self::InvalidHandle(_) | Self::CounterUnderflow { .. }
        )
    }

    /// Map a driver failure from an allocation call.
    pub(crate) fn from_alloc(device: DeviceId, requested: u64, source: DriverError) -> Self {
        match source {
            DriverError::OutOfMemory { .. } => Self::OutOfMemory {
                device,
                requested,
                source,
            },
            other => Self::from(other),
        }
    }
}

impl From<DriverError> for MemoryError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::OutOfMemory { device, requested, .. } => Self::OutOfMemory {
                device,
                requested,
                source: err,
            },
            DriverError::InvalidDevice(device) => {
                Self::InvalidHandle(format!("unknown device {device}"))
            }
            DriverError::UnknownPointer { device, address } => Self::InvalidHandle(format!(
                "pointer {address:#x} is not live on device {device}"
            )),
            DriverError::QueryFailed { device, .. } => Self::HardwareQuery { device, source: err },
        }
    }
}

/// Result alias for the memory subsystem.
pub type Result<T, E = MemoryError> = std::result::Result<T, E>;
