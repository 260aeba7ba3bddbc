//! Application configuration from CLI flags and environment.

use std::path::PathBuf;

use clap::Parser;

use accelmem_core::{MemoryConfig, ProviderKind};
use accelmem_workspace::{MirroringPolicy, SpillPolicy, WorkspaceConfiguration};

/// Exercise accelerator memory providers and report their counters.
#[derive(Parser, Debug)]
#[command(name = "accelmem", version, about)]
pub struct AppConfig {
    /// Number of simulated devices.
    #[arg(long, default_value = "1", env = "ACCELMEM_DEVICES")]
    pub devices: usize,

    /// Memory per simulated device (e.g., "512M", "4G").
    #[arg(long, default_value = "4G", env = "ACCELMEM_DEVICE_MEMORY")]
    pub device_memory: String,

    /// Allocation provider: direct, host-pinned-caching, or full-caching.
    #[arg(long, env = "ACCELMEM_PROVIDER")]
    pub provider: Option<ProviderKind>,

    /// JSON file with the memory configuration (provider and cache limits).
    #[arg(long, env = "ACCELMEM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of worker threads.
    #[arg(short, long, default_value = "4", env = "ACCELMEM_THREADS")]
    pub threads: usize,

    /// Buffer requests per worker.
    #[arg(short, long, default_value = "100")]
    pub iterations: usize,

    /// Run every iteration inside a workspace of this initial size (e.g., "1M").
    #[arg(long)]
    pub workspace_size: Option<String>,

    /// Workspace mirroring: full or host-only.
    #[arg(long, default_value = "full")]
    pub mirroring: MirroringPolicy,

    /// Workspace overflow handling: external, fail, or reallocate.
    #[arg(long, default_value = "external")]
    pub spill: SpillPolicy,

    /// Abort on accounting defects (always on in debug builds).
    #[arg(long, env = "ACCELMEM_STRICT_ACCOUNTING")]
    pub strict_accounting: bool,

    /// Print the report as JSON.
    #[arg(long)]
    pub json: bool,

    /// Verbose output.
    #[arg(short, long)]
    pub verbose: bool,

    /// Generate shell completion.
    #[arg(long, value_enum)]
    pub completion: Option<clap_complete::Shell>,
}

impl AppConfig {
    /// Parse CLI arguments.
    #[must_use]
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    /// Memory configuration: the config file when given, then `--provider`
    /// on top.
    pub fn memory_config(&self) -> anyhow::Result<MemoryConfig> {
        let mut memory = match &self.config {
            Some(path) => accelmem_core::config::load_from_path(path)?,
            None => MemoryConfig::default(),
        };
        if let Some(provider) = self.provider {
            memory.provider = provider;
        }
        memory.strict_accounting |= self.strict_accounting || cfg!(debug_assertions);
        Ok(memory)
    }

    /// Capacity of each simulated device in bytes.
    pub fn device_capacity(&self) -> anyhow::Result<u64> {
        let bytes = parse_memory_size(&self.device_memory).map_err(anyhow::Error::msg)?;
        if bytes == 0 {
            anyhow::bail!("device memory must be positive");
        }
        Ok(bytes)
    }

    /// Workspace configuration, when `--workspace-size` is given.
    pub fn workspace_config(&self) -> anyhow::Result<Option<WorkspaceConfiguration>> {
        let Some(size) = &self.workspace_size else {
            return Ok(None);
        };
        let initial = parse_memory_size(size).map_err(anyhow::Error::msg)?;
        let config = WorkspaceConfiguration::builder()
            .initial_size(initial)
            .policy_mirroring(self.mirroring)
            .policy_spill(self.spill)
            .build();
        config.validate()?;
        Ok(Some(config))
    }
}

/// Parse a memory size like "8G", "512M", "64K" or "300".
pub fn parse_memory_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(0);
    }

    let upper = s.to_ascii_uppercase();
    let (num_str, multiplier) = if let Some(n) = upper.strip_suffix('G') {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix('M') {
        (n, 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix('K') {
        (n, 1024)
    } else if let Some(n) = upper.strip_suffix('B') {
        (n, 1)
    } else {
        (upper.as_str(), 1)
    };

    let value: u64 = num_str
        .trim()
        .parse()
        .map_err(|e| format!("invalid memory size '{s}': {e}"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("memory size '{s}' is too large"))
}
