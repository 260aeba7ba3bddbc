//! # accelmem-workspace
//!
//! Named, thread-confined workspaces: arenas reserved once and reused across
//! repeated computations, with scoped activation through
//! [`WorkspaceManager`].
#![warn(missing_docs)]

pub mod arena;
pub mod configuration;
pub mod manager;
pub mod workspace;

pub use configuration::{
    AllocationPolicy, MirroringPolicy, SpillPolicy, WorkspaceConfiguration,
    WorkspaceConfigurationBuilder, SAFETY_OFFSET,
};
pub use manager::{WorkspaceManager, WorkspaceScope};
pub use workspace::{Workspace, WorkspaceState};
