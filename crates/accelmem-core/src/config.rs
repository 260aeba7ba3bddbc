//! Runtime configuration (serializable) and its JSON persistence.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_MAX_CACHEABLE_BLOCK_BYTES, DEFAULT_MAX_DEVICE_CACHE_BYTES, DEFAULT_MAX_HOST_CACHE_BYTES,
};
use crate::error::{MemoryError, Result};
use crate::provider::ProviderKind;

/// Limits of the caching providers, per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Device bytes a caching provider may retain per device.
    pub max_device_cache_bytes: u64,
    /// Pinned host bytes a caching provider may retain per device.
    pub max_host_cache_bytes: u64,
    /// Blocks above this size are always released to hardware.
    pub max_cacheable_block_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_device_cache_bytes: DEFAULT_MAX_DEVICE_CACHE_BYTES,
            max_host_cache_bytes: DEFAULT_MAX_HOST_CACHE_BYTES,
            max_cacheable_block_bytes: DEFAULT_MAX_CACHEABLE_BLOCK_BYTES,
        }
    }
}

/// Memory runtime configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Allocation strategy.
    pub provider: ProviderKind,
    /// Cache limits for the caching strategies.
    pub cache: CacheConfig,
    /// Panic on accounting defects instead of returning them.
    pub strict_accounting: bool,
}

impl MemoryConfig {
    /// Configuration using the given provider and default cache limits.
    #[must_use]
    pub fn with_provider(provider: ProviderKind) -> Self {
        Self {
            provider,
            ..Self::default()
        }
    }
}

/// Load a configuration from a JSON file. Missing fields take defaults.
pub fn load_from_path(path: &Path) -> Result<MemoryConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| MemoryError::Config(format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_str(&content)
        .map_err(|e| MemoryError::Config(format!("invalid config {}: {e}", path.display())))
}

/// Save a configuration as pretty JSON.
pub fn save_to_path(config: &MemoryConfig, path: &Path) -> Result<()> {
    let content =
        serde_json::to_string_pretty(config).map_err(|e| MemoryError::Config(e.to_string()))?;
    std::fs::write(path, content)
        .map_err(|e| MemoryError::Config(format!("cannot write {}: {e}", path.display())))
}
