//! Error handling and exit codes.

use accelmem_core::MemoryError;

/// Process exit codes.
pub mod exit_codes {
    /// Run completed.
    pub const SUCCESS: i32 = 0;
    /// Any failure not covered below.
    pub const ERROR_GENERIC: i32 = 1;
    /// A device, pinned pool or workspace ran out of memory.
    pub const ERROR_OUT_OF_MEMORY: i32 = 2;
    /// A hardware query failed.
    pub const ERROR_HARDWARE: i32 = 3;
    /// Invalid configuration.
    pub const ERROR_CONFIG: i32 = 4;
    /// Accounting defect (invalid handle, counter underflow).
    pub const ERROR_DEFECT: i32 = 70;
}

/// Exit code for a memory subsystem error.
#[must_use]
pub fn handle_error(err: &MemoryError) -> i32 {
    match err {
        MemoryError::OutOfMemory { .. } | MemoryError::WorkspaceExhausted { .. } => {
            exit_codes::ERROR_OUT_OF_MEMORY
        }
        MemoryError::HardwareQuery { .. } => exit_codes::ERROR_HARDWARE,
        MemoryError::Config(_) => exit_codes::ERROR_CONFIG,
        MemoryError::InvalidHandle(_) | MemoryError::CounterUnderflow { .. } => {
            exit_codes::ERROR_DEFECT
        }
        MemoryError::InvalidRequest(_) => exit_codes::ERROR_GENERIC,
    }
}

/// Exit code for any application error.
#[must_use]
pub fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<MemoryError>())
        .map_or(exit_codes::ERROR_GENERIC, handle_error)
}
