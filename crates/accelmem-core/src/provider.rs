//! Allocation provider trait and factory.
//!
//! A provider turns an [`AllocationShape`] into memory for an
//! [`AllocationPoint`], keeping the [`MemoryTracker`] in step. The three
//! strategies differ only in what happens to freed memory.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::caching::FullCachingProvider;
use crate::config::CacheConfig;
use crate::device::MemoryDriver;
use crate::direct::DirectProvider;
use crate::error::{MemoryError, Result};
use crate::pinned::HostPinnedCachingProvider;
use crate::point::{AllocationPoint, AllocationStatus, PointersPair};
use crate::shape::AllocationShape;
use crate::stats::CacheStats;
use crate::tracker::MemoryTracker;

/// Strategy for obtaining and releasing buffer memory.
pub trait MemoryProvider: Send + Sync {
    /// Obtain memory for `point` with the requested placement.
    ///
    /// The point is not modified; store the result with
    /// [`AllocationPoint::set_pointers`].
    fn malloc(
        &self,
        shape: &AllocationShape,
        point: &AllocationPoint,
        status: AllocationStatus,
    ) -> Result<PointersPair>;

    /// Release the memory of `point` and mark it deallocated.
    fn free(&self, point: &mut AllocationPoint) -> Result<()>;

    /// Release every cached block to hardware, returning the bytes released.
    fn purge_cache(&self) -> Result<u64> {
        Ok(0)
    }

    /// Cache usage statistics.
    fn cache_stats(&self) -> CacheStats {
        CacheStats::default()
    }

    /// Name of this strategy.
    fn name(&self) -> &'static str;

    /// Set the shape of an unallocated point, `malloc` it and store the
    /// pointers.
    fn allocate(
        &self,
        shape: &AllocationShape,
        point: &mut AllocationPoint,
        status: AllocationStatus,
    ) -> Result<()> {
        if point.status() != AllocationStatus::Unallocated {
            return Err(MemoryError::InvalidHandle(format!(
                "point {} is already {}",
                point.id(),
                point.status()
            )));
        }
        point.set_shape(*shape);
        let pointers = self.malloc(shape, point, status)?;
        point.set_pointers(pointers);
        Ok(())
    }
}

/// Available provider strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// Every request goes to hardware.
    Direct,
    /// Pinned host blocks are cached; device requests go to hardware.
    HostPinnedCaching,
    /// Device and pinned host blocks are cached.
    #[default]
    FullCaching,
}

impl ProviderKind {
    /// All strategies.
    pub const ALL: [Self; 3] = [Self::Direct, Self::HostPinnedCaching, Self::FullCaching];

    /// Canonical name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::HostPinnedCaching => "host-pinned-caching",
            Self::FullCaching => "full-caching",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "pinned" | "host-pinned-caching" => Ok(Self::HostPinnedCaching),
            "caching" | "full-caching" => Ok(Self::FullCaching),
            other => Err(MemoryError::Config(format!("unknown provider: {other}"))),
        }
    }
}

/// Build the provider selected by `kind`.
#[must_use]
pub fn build_provider(
    kind: ProviderKind,
    tracker: Arc<MemoryTracker>,
    driver: Arc<dyn MemoryDriver>,
    cache: &CacheConfig,
) -> Arc<dyn MemoryProvider> {
    tracing::debug!(provider = %kind, "building allocation provider");
    match kind {
        ProviderKind::Direct => Arc::new(DirectProvider::new(tracker, driver)),
        ProviderKind::HostPinnedCaching => {
            Arc::new(HostPinnedCachingProvider::new(tracker, driver, cache))
        }
        ProviderKind::FullCaching => Arc::new(FullCachingProvider::new(tracker, driver, cache)),
    }
}

/// Validate a malloc request, returning its size in bytes.
pub(crate) fn check_request(shape: &AllocationShape, status: AllocationStatus) -> Result<u64> {
    if shape.is_empty() {
        return Err(MemoryError::InvalidRequest(
            "cannot allocate an empty shape".to_string(),
        ));
    }
    match status {
        AllocationStatus::Device | AllocationStatus::Host => Ok(shape.number_of_bytes()),
        other => Err(MemoryError::InvalidRequest(format!(
            "cannot allocate with status {other}"
        ))),
    }
}

/// Validate a free request, returning the point's size in bytes.
pub(crate) fn check_release(point: &AllocationPoint) -> Result<u64> {
    if let Some(tag) = point.owning_workspace() {
        return Err(MemoryError::InvalidHandle(format!(
            "point {} is borrowed from workspace '{}'",
            point.id(),
            tag.name()
        )));
    }
    if !point.is_allocated() {
        return Err(MemoryError::InvalidHandle(format!(
            "point {} is {}",
            point.id(),
            point.status()
        )));
    }
    point
        .shape()
        .map(AllocationShape::number_of_bytes)
        .ok_or_else(|| MemoryError::InvalidHandle(format!("point {} has no shape", point.id())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimulatedDriver;

    fn provider(kind: ProviderKind) -> Arc<dyn MemoryProvider> {
        let driver: Arc<dyn MemoryDriver> = Arc::new(SimulatedDriver::new(1, 1 << 24));
        let tracker = Arc::new(MemoryTracker::new(Arc::clone(&driver)));
        build_provider(kind, tracker, driver, &CacheConfig::default())
    }

    #[test]
    fn factory_builds_each_kind() {
        assert_eq!(provider(ProviderKind::Direct).name(), "direct");
        assert_eq!(
            provider(ProviderKind::HostPinnedCaching).name(),
            "host-pinned-caching"
        );
        assert_eq!(provider(ProviderKind::FullCaching).name(), "full-caching");
    }

    #[test]
    fn kind_parsing() {
        assert_eq!("direct".parse::<ProviderKind>().unwrap(), ProviderKind::Direct);
        assert_eq!(
            "Pinned".parse::<ProviderKind>().unwrap(),
            ProviderKind::HostPinnedCaching
        );
        assert_eq!(
            "full-caching".parse::<ProviderKind>().unwrap(),
            ProviderKind::FullCaching
        );
        assert!("nonexistent".parse::<ProviderKind>().is_err());
        for kind in ProviderKind::ALL {
            assert_eq!(kind.to_string().parse::<ProviderKind>().unwrap(), kind);
        }
    }

    #[test]
    fn allocate_rejects_reused_point() {
        let provider = provider(ProviderKind::Direct);
        let shape = AllocationShape::new(16, 4);
        let mut point = AllocationPoint::new(0);
        provider
            .allocate(&shape, &mut point, AllocationStatus::Device)
            .unwrap();
        provider.free(&mut point).unwrap();
        assert!(matches!(
            provider.allocate(&shape, &mut point, AllocationStatus::Device),
            Err(MemoryError::InvalidHandle(_))
        ));
    }

    #[test]
    fn request_validation() {
        assert!(matches!(
            check_request(&AllocationShape::new(0, 4), AllocationStatus::Device),
            Err(MemoryError::InvalidRequest(_))
        ));
        assert!(matches!(
            check_request(&AllocationShape::new(1, 4), AllocationStatus::Deallocated),
            Err(MemoryError::InvalidRequest(_))
        ));
        assert_eq!(
            check_request(&AllocationShape::new(3, 4), AllocationStatus::Host).unwrap(),
            12
        );
    }

    #[test]
    fn release_validation() {
        let point = AllocationPoint::new(0);
        assert!(matches!(
            check_release(&point),
            Err(MemoryError::InvalidHandle(_))
        ));
    }
}
