//! Constants for cache limits and provider defaults.

/// Default device bytes a caching provider retains per device (2 GiB).
pub const DEFAULT_MAX_DEVICE_CACHE_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Default pinned host bytes a caching provider retains per device (1 GiB).
pub const DEFAULT_MAX_HOST_CACHE_BYTES: u64 = 1024 * 1024 * 1024;

/// Default largest block kept in a cache (128 MiB).
pub const DEFAULT_MAX_CACHEABLE_BLOCK_BYTES: u64 = 128 * 1024 * 1024;
