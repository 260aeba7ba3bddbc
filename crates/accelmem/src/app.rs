//! Application entry point and dispatch.

use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use clap_complete::generate;

use accelmem_core::{MemoryRuntime, SimulatedDriver};

use crate::config::AppConfig;
use crate::report::Report;
use crate::workload::{run_workload, WorkloadOptions};

/// Run the application.
pub fn run(config: &AppConfig) -> Result<()> {
    if let Some(shell) = config.completion {
        let mut cmd = <AppConfig as clap::CommandFactory>::command();
        generate(shell, &mut cmd, "accelmem", &mut std::io::stdout());
        return Ok(());
    }

    let report = execute(config)?;
    let mut stdout = std::io::stdout().lock();
    if config.json {
        writeln!(stdout, "{}", report.to_json()?)?;
    } else {
        write!(stdout, "{report}")?;
    }
    Ok(())
}

/// Run the workload against a fresh simulated runtime and build the report.
pub fn execute(config: &AppConfig) -> Result<Report> {
    let memory = config.memory_config()?;
    let capacity = config.device_capacity()?;
    let options = WorkloadOptions {
        threads: config.threads,
        iterations: config.iterations,
        workspace: config.workspace_config()?,
    };
    if config.devices == 0 {
        anyhow::bail!("at least one device is required");
    }

    let driver = Arc::new(SimulatedDriver::new(config.devices, capacity));
    let runtime = MemoryRuntime::new(driver, &memory);
    tracing::info!(
        provider = %runtime.provider_kind(),
        devices = config.devices,
        capacity,
        threads = options.threads,
        "starting workload"
    );

    let summary = run_workload(&runtime, &options)?;
    let mut report = Report::collect(&runtime, summary)?;
    report.purged_bytes = runtime.shutdown()?;
    Ok(report)
}
