//! Runtime context bundling the driver, tracker and configured provider.

use std::sync::Arc;

use crate::config::MemoryConfig;
use crate::device::MemoryDriver;
use crate::error::Result;
use crate::provider::{build_provider, MemoryProvider, ProviderKind};
use crate::tracker::MemoryTracker;

/// Shared handles for one process-wide memory context.
///
/// Clones share the same tracker, driver and provider.
#[derive(Clone)]
pub struct MemoryRuntime {
    tracker: Arc<MemoryTracker>,
    driver: Arc<dyn MemoryDriver>,
    provider: Arc<dyn MemoryProvider>,
    kind: ProviderKind,
}

impl MemoryRuntime {
    /// Build the tracker and the provider selected by `config`.
    #[must_use]
    pub fn new(driver: Arc<dyn MemoryDriver>, config: &MemoryConfig) -> Self {
        let tracker = Arc::new(
            MemoryTracker::new(Arc::clone(&driver)).with_strict_accounting(config.strict_accounting),
        );
        let provider = build_provider(
            config.provider,
            Arc::clone(&tracker),
            Arc::clone(&driver),
            &config.cache,
        );
        tracing::debug!(
            provider = %config.provider,
            devices = driver.device_count(),
            "memory runtime started"
        );
        Self {
            tracker,
            driver,
            provider,
            kind: config.provider,
        }
    }

    /// Accounting service.
    #[must_use]
    pub fn tracker(&self) -> &Arc<MemoryTracker> {
        &self.tracker
    }

    /// Hardware driver.
    #[must_use]
    pub fn driver(&self) -> &Arc<dyn MemoryDriver> {
        &self.driver
    }

    /// Configured provider.
    #[must_use]
    pub fn provider(&self) -> &Arc<dyn MemoryProvider> {
        &self.provider
    }

    /// Strategy of the configured provider.
    #[must_use]
    pub fn provider_kind(&self) -> ProviderKind {
        self.kind
    }

    /// Number of devices exposed by the driver.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.driver.device_count()
    }

    /// Release every cached block to hardware, returning the bytes released.
    pub fn shutdown(&self) -> Result<u64> {
        let released = self.provider.purge_cache()?;
        tracing::debug!(released, "memory runtime shut down");
        Ok(released)
    }
}
