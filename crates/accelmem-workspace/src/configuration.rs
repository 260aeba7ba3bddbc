//! Workspace policies and configuration.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use accelmem_core::{MemoryError, Result};

/// Padding added above every non-empty arena reservation.
pub const SAFETY_OFFSET: u64 = 1024;

/// How much memory a workspace reserves up front.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPolicy {
    /// Reserve exactly the initial size.
    #[default]
    Strict,
    /// Reserve `initial_size × (1 + overallocation_limit)`.
    Overallocate,
}

/// Which side of memory a workspace reserves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirroringPolicy {
    /// Matching device and host arenas.
    #[default]
    Full,
    /// Host arena only; device counters stay untouched.
    HostOnly,
}

/// What happens to a request that does not fit in the arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpillPolicy {
    /// Draw the buffer from the provider and attribute it to the workspace.
    #[default]
    External,
    /// Fail with `WorkspaceExhausted`.
    Fail,
    /// Grow the arena: immediately when nothing is borrowed from it in the
    /// current cycle, otherwise spill now and grow at the next cycle.
    Reallocate,
}

impl FromStr for MirroringPolicy {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "full" | "mirrored" => Ok(Self::Full),
            "host_only" | "host" => Ok(Self::HostOnly),
            other => Err(MemoryError::Config(format!("unknown mirroring policy: {other}"))),
        }
    }
}

impl FromStr for SpillPolicy {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "external" => Ok(Self::External),
            "fail" => Ok(Self::Fail),
            "reallocate" | "grow" => Ok(Self::Reallocate),
            other => Err(MemoryError::Config(format!("unknown spill policy: {other}"))),
        }
    }
}

/// Configuration of a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfiguration {
    /// Up-front reservation policy.
    pub allocation_policy: AllocationPolicy,
    /// Requested arena size in bytes (0 = defer until first use).
    pub initial_size: u64,
    /// Extra fraction reserved under [`AllocationPolicy::Overallocate`].
    pub overallocation_limit: f64,
    /// Upper bound on the arena in bytes (0 = unlimited).
    pub max_size: u64,
    /// Device/host mirroring.
    pub mirroring_policy: MirroringPolicy,
    /// Overflow handling.
    pub spill_policy: SpillPolicy,
}

impl Default for WorkspaceConfiguration {
    fn default() -> Self {
        Self {
            allocation_policy: AllocationPolicy::Strict,
            initial_size: 0,
            overallocation_limit: 0.3,
            max_size: 0,
            mirroring_policy: MirroringPolicy::Full,
            spill_policy: SpillPolicy::External,
        }
    }
}

impl WorkspaceConfiguration {
    /// Start a builder from the defaults.
    #[must_use]
    pub fn builder() -> WorkspaceConfigurationBuilder {
        WorkspaceConfigurationBuilder {
            config: Self::default(),
        }
    }

    /// Check the configuration for inconsistent values.
    pub fn validate(&self) -> Result<()> {
        if !self.overallocation_limit.is_finite() || self.overallocation_limit < 0.0 {
            return Err(MemoryError::Config(format!(
                "overallocation limit must be a non-negative number, got {}",
                self.overallocation_limit
            )));
        }
        if self.max_size > 0 && self.initial_size > 0 {
            let needed = self.initial_size.saturating_add(SAFETY_OFFSET);
            if needed > self.max_size {
                return Err(MemoryError::Config(format!(
                    "initial size {} plus safety offset exceeds max size {}",
                    self.initial_size, self.max_size
                )));
            }
        }
        Ok(())
    }

    /// Bytes reserved when the workspace is created: the initial size (grown
    /// by the overallocation limit when requested) plus [`SAFETY_OFFSET`],
    /// capped by `max_size`. Zero when `initial_size` is zero.
    #[must_use]
    pub fn reservation_bytes(&self) -> u64 {
        if self.initial_size == 0 {
            return 0;
        }
        let base = match self.allocation_policy {
            AllocationPolicy::Strict => self.initial_size,
            AllocationPolicy::Overallocate => {
                self.initial_size.saturating_add(fraction_of(self.initial_size, self.overallocation_limit))
            }
        };
        self.cap(base.saturating_add(SAFETY_OFFSET))
    }

    /// Clamp `bytes` to `max_size` when one is set.
    #[must_use]
    pub fn cap(&self, bytes: u64) -> u64 {
        if self.max_size == 0 {
            bytes
        } else {
            bytes.min(self.max_size)
        }
    }
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn fraction_of(bytes: u64, fraction: f64) -> u64 {
    (bytes as f64 * fraction).ceil() as u64
}

/// Builder for [`WorkspaceConfiguration`].
#[derive(Debug, Clone)]
pub struct WorkspaceConfigurationBuilder {
    config: WorkspaceConfiguration,
}

impl WorkspaceConfigurationBuilder {
    /// Set the allocation policy.
    #[must_use]
    pub fn policy_allocation(mut self, policy: AllocationPolicy) -> Self {
        self.config.allocation_policy = policy;
        self
    }

    /// Set the initial arena size in bytes.
    #[must_use]
    pub fn initial_size(mut self, bytes: u64) -> Self {
        self.config.initial_size = bytes;
        self
    }

    /// Set the overallocation fraction.
    #[must_use]
    pub fn overallocation_limit(mut self, fraction: f64) -> Self {
        self.config.overallocation_limit = fraction;
        self
    }

    /// Set the maximum arena size in bytes (0 = unlimited).
    #[must_use]
    pub fn max_size(mut self, bytes: u64) -> Self {
        self.config.max_size = bytes;
        self
    }

    /// Set the mirroring policy.
    #[must_use]
    pub fn policy_mirroring(mut self, policy: MirroringPolicy) -> Self {
        self.config.mirroring_policy = policy;
        self
    }

    /// Set the spill policy.
    #[must_use]
    pub fn policy_spill(mut self, policy: SpillPolicy) -> Self {
        self.config.spill_policy = policy;
        self
    }

    /// Finish the configuration.
    #[must_use]
    pub fn build(self) -> WorkspaceConfiguration {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = WorkspaceConfiguration::default();
        assert_eq!(config.allocation_policy, AllocationPolicy::Strict);
        assert_eq!(config.mirroring_policy, MirroringPolicy::Full);
        assert_eq!(config.spill_policy, SpillPolicy::External);
        assert_eq!(config.reservation_bytes(), 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn strict_reservation_adds_safety_offset() {
        let config = WorkspaceConfiguration::builder()
            .policy_allocation(AllocationPolicy::Strict)
            .initial_size(1024)
            .build();
        assert_eq!(config.reservation_bytes(), 2048);
    }

    #[test]
    fn overallocation() {
        let config = WorkspaceConfiguration::builder()
            .policy_allocation(AllocationPolicy::Overallocate)
            .initial_size(1000)
            .overallocation_limit(0.5)
            .build();
        assert_eq!(config.reservation_bytes(), 1500 + SAFETY_OFFSET);
    }

    #[test]
    fn reservation_is_capped() {
        let config = WorkspaceConfiguration::builder()
            .policy_allocation(AllocationPolicy::Overallocate)
            .initial_size(1000)
            .overallocation_limit(2.0)
            .max_size(2500)
            .build();
        assert!(config.validate().is_ok());
        assert_eq!(config.reservation_bytes(), 2500);
    }

    #[test]
    fn invalid_configurations() {
        let negative = WorkspaceConfiguration::builder()
            .overallocation_limit(-1.0)
            .build();
        assert!(matches!(negative.validate(), Err(MemoryError::Config(_))));

        let nan = WorkspaceConfiguration::builder()
            .overallocation_limit(f64::NAN)
            .build();
        assert!(nan.validate().is_err());

        let too_small = WorkspaceConfiguration::builder()
            .initial_size(4096)
            .max_size(4096)
            .build();
        assert!(too_small.validate().is_err());
    }

    #[test]
    fn policy_parsing() {
        assert_eq!("host-only".parse::<MirroringPolicy>().unwrap(), MirroringPolicy::HostOnly);
        assert_eq!("FULL".parse::<MirroringPolicy>().unwrap(), MirroringPolicy::Full);
        assert_eq!("grow".parse::<SpillPolicy>().unwrap(), SpillPolicy::Reallocate);
        assert!("sometimes".parse::<SpillPolicy>().is_err());
    }

    #[test]
    fn serde_names() {
        let config: WorkspaceConfiguration = serde_json::from_str(
            r#"{"initial_size": 64, "mirroring_policy": "host_only", "spill_policy": "reallocate"}"#,
        )
        .unwrap();
        assert_eq!(config.initial_size, 64);
        assert_eq!(config.mirroring_policy, MirroringPolicy::HostOnly);
        assert_eq!(config.spill_policy, SpillPolicy::Reallocate);
        assert_eq!(config.allocation_policy, AllocationPolicy::Strict);
    }
}
