//! # accelmem-core
//!
//! Memory accounting and allocation providers for accelerator buffers.
//!
//! A [`MemoryTracker`] keeps per-device byte counters. Providers implementing
//! [`MemoryProvider`] obtain device and pinned host memory through a
//! [`MemoryDriver`], either directly or through size-bucketed caches.
#![warn(missing_docs)]

pub mod cache;
pub mod caching;
pub mod config;
pub mod constants;
pub mod device;
pub mod direct;
pub mod error;
pub mod pinned;
pub mod point;
pub mod provider;
pub mod runtime;
pub mod shape;
pub mod stats;
pub mod tracker;

pub use caching::FullCachingProvider;
pub use config::{CacheConfig, MemoryConfig};
pub use device::{DeviceId, DevicePtr, HostPtr, MemoryDriver, SimulatedDriver};
pub use direct::DirectProvider;
pub use error::{DriverError, MemoryError, Result};
pub use pinned::HostPinnedCachingProvider;
pub use point::{AllocationPoint, AllocationStatus, PointersPair, WorkspaceTag};
pub use provider::{build_provider, MemoryProvider, ProviderKind};
pub use runtime::MemoryRuntime;
pub use shape::{AllocationShape, BufferDescriptor, BufferShape, DataType};
pub use stats::CacheStats;
pub use tracker::{CounterKind, CounterSnapshot, MemoryTracker};
