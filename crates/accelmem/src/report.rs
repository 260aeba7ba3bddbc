//! Post-run report: device counters, free memory, cache and host stats.

use std::fmt;

use serde::Serialize;
use sysinfo::System;

use accelmem_core::{CacheStats, CounterSnapshot, MemoryRuntime};

use crate::workload::WorkloadSummary;

/// Counters and memory figures of one device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceReport {
    /// Tracker counters.
    #[serde(flatten)]
    pub counters: CounterSnapshot,
    /// Total device memory.
    pub total_memory: u64,
    /// Total minus allocated.
    pub approximate_free_memory: u64,
    /// Free memory reported by the driver.
    pub precise_free_memory: u64,
}

/// Memory of the machine running the tool.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HostMemory {
    /// Installed memory in bytes.
    pub total_bytes: u64,
    /// Used memory in bytes.
    pub used_bytes: u64,
}

impl HostMemory {
    /// Sample the current host memory.
    #[must_use]
    pub fn collect() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        Self {
            total_bytes: system.total_memory(),
            used_bytes: system.used_memory(),
        }
    }
}

/// Full report of one run.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    /// Provider strategy.
    pub provider: String,
    /// Workload statistics.
    pub workload: WorkloadSummary,
    /// Per-device figures, taken before caches were purged.
    pub devices: Vec<DeviceReport>,
    /// Provider cache statistics.
    pub cache: CacheStats,
    /// Bytes released by the final cache purge.
    pub purged_bytes: u64,
    /// Host machine memory.
    pub host: HostMemory,
}

impl Report {
    /// Gather the report from `runtime`.
    pub fn collect(runtime: &MemoryRuntime, workload: WorkloadSummary) -> accelmem_core::Result<Self> {
        let tracker = runtime.tracker();
        let devices = (0..runtime.device_count())
            .map(|device| {
                Ok(DeviceReport {
                    counters: tracker.snapshot(device),
                    total_memory: tracker.total_memory(device)?,
                    approximate_free_memory: tracker.approximate_free_memory(device)?,
                    precise_free_memory: tracker.precise_free_memory(device)?,
                })
            })
            .collect::<accelmem_core::Result<Vec<_>>>()?;
        Ok(Self {
            provider: runtime.provider_kind().to_string(),
            workload,
            devices,
            cache: runtime.provider().cache_stats(),
            purged_bytes: 0,
            host: HostMemory::collect(),
        })
    }

    /// Pretty JSON rendering.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let w = &self.workload;
        writeln!(f, "Provider: {}", self.provider)?;
        writeln!(
            f,
            "Workload: {} workers, {} buffers ({} borrowed), {} requested, {} spilled, {} ms",
            w.workers,
            w.buffers,
            w.borrowed,
            format_bytes(w.requested_bytes),
            format_bytes(w.spilled_bytes),
            w.elapsed_ms
        )?;
        for device in &self.devices {
            write!(f, "{device}")?;
        }
        let c = &self.cache;
        writeln!(
            f,
            "Cache: {} hits, {} misses ({:.1}% hit rate), {} evictions",
            c.hits,
            c.misses,
            c.hit_rate() * 100.0,
            c.evictions
        )?;
        writeln!(
            f,
            "Blocks: {} retained, {} issued, {} purged",
            c.cached_blocks,
            c.issued_blocks,
            format_bytes(self.purged_bytes)
        )?;
        writeln!(
            f,
            "Host memory: {} used of {}",
            format_bytes(self.host.used_bytes),
            format_bytes(self.host.total_bytes)
        )
    }
}

impl fmt::Display for DeviceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counters;
        let rows = [
            ("allocated", c.allocated),
            ("cached", c.cached),
            ("host allocated", c.host_allocated),
            ("host cached", c.host_cached),
            ("workspace allocated", c.workspace_allocated),
            ("workspace host allocated", c.workspace_host_allocated),
        ];
        writeln!(f, "Device {}:", c.device)?;
        for (label, bytes) in rows {
            writeln!(f, "  {:<26}{}", format!("{label}:"), format_bytes(bytes))?;
        }
        writeln!(
            f,
            "  {:<26}{} approximate, {} precise (of {})",
            "free memory:",
            format_bytes(self.approximate_free_memory),
            format_bytes(self.precise_free_memory),
            format_bytes(self.total_memory)
        )
    }
}

/// Format a byte count with a binary unit.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [(&str, u64); 3] = [("GiB", 1 << 30), ("MiB", 1 << 20), ("KiB", 1 << 10)];
    for (unit, size) in UNITS {
        if bytes >= size {
            return format!("{:.1} {unit}", bytes as f64 / size as f64);
        }
    }
    format!("{bytes} B")
}
