//! accelmem library: the diagnostics application around the memory
//! providers and workspaces.

pub mod app;
pub mod config;
pub mod errors;
pub mod report;
pub mod workload;
