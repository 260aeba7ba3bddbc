//! Concurrent allocation workload.
//!
//! Every worker owns a [`WorkspaceManager`] on device `worker % devices` and
//! issues buffer requests of varying sizes, optionally inside a workspace
//! that is re-entered every iteration and destroyed at the end.

use std::time::{Duration, Instant};

use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde::Serialize;

use accelmem_core::{AllocationShape, BufferDescriptor, DataType, MemoryRuntime, Result};
use accelmem_workspace::{WorkspaceConfiguration, WorkspaceManager};

/// Buffers requested per iteration.
pub const BUFFERS_PER_ITERATION: usize = 3;

const DATA_TYPES: [DataType; 4] = [DataType::Float, DataType::Double, DataType::Int, DataType::Half];

/// Workload parameters.
#[derive(Debug, Clone)]
pub struct WorkloadOptions {
    /// Number of workers.
    pub threads: usize,
    /// Iterations per worker.
    pub iterations: usize,
    /// Workspace to run every iteration in, if any.
    pub workspace: Option<WorkspaceConfiguration>,
}

/// Aggregated workload statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkloadSummary {
    /// Workers that ran.
    pub workers: usize,
    /// Buffers requested.
    pub buffers: u64,
    /// Buffers served by a workspace.
    pub borrowed: u64,
    /// Bytes requested.
    pub requested_bytes: u64,
    /// Bytes spilled out of workspace arenas.
    pub spilled_bytes: u64,
    /// Wall-clock time in milliseconds.
    pub elapsed_ms: u64,
}

impl std::ops::Add for WorkloadSummary {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            workers: self.workers + rhs.workers,
            buffers: self.buffers + rhs.buffers,
            borrowed: self.borrowed + rhs.borrowed,
            requested_bytes: self.requested_bytes + rhs.requested_bytes,
            spilled_bytes: self.spilled_bytes + rhs.spilled_bytes,
            elapsed_ms: self.elapsed_ms.max(rhs.elapsed_ms),
        }
    }
}

/// Shape of the `index`-th buffer of `iteration` on `worker`.
#[must_use]
pub fn buffer_shape(worker: usize, iteration: usize, index: usize) -> AllocationShape {
    let step = worker + iteration + index;
    let data_type = DATA_TYPES[step % DATA_TYPES.len()];
    let length = 16u64 << (step % 8);
    AllocationShape::of(&BufferDescriptor::new(data_type, length))
}

/// Run the workload on a dedicated rayon pool.
pub fn run_workload(runtime: &MemoryRuntime, options: &WorkloadOptions) -> anyhow::Result<WorkloadSummary> {
    let pool = ThreadPoolBuilder::new()
        .num_threads(options.threads.max(1))
        .thread_name(|i| format!("accelmem-worker-{i}"))
        .build()?;

    let start = Instant::now();
    let summaries: Vec<WorkloadSummary> = pool.install(|| {
        (0..options.threads)
            .into_par_iter()
            .map(|worker| run_worker(runtime, worker, options))
            .collect::<Result<Vec<_>>>()
    })?;

    let mut summary = summaries
        .into_iter()
        .fold(WorkloadSummary::default(), |acc, s| acc + s);
    summary.elapsed_ms = duration_ms(start.elapsed());
    tracing::debug!(?summary, "workload finished");
    Ok(summary)
}

fn run_worker(runtime: &MemoryRuntime, worker: usize, options: &WorkloadOptions) -> Result<WorkloadSummary> {
    let device = worker % runtime.device_count().max(1);
    let mut manager = WorkspaceManager::new(runtime, device)?;
    let name = format!("worker-{worker}");
    let mut summary = WorkloadSummary {
        workers: 1,
        ..WorkloadSummary::default()
    };

    for iteration in 0..options.iterations {
        match &options.workspace {
            Some(config) => {
                let cycle = manager.with_workspace(config, &name, |m| {
                    let mut cycle = run_iteration(m, worker, iteration)?;
                    cycle.spilled_bytes = m.workspace_for_current_thread(&name)?.spilled_bytes();
                    Ok(cycle)
                })?;
                summary = summary + cycle;
            }
            None => summary = summary + run_iteration(&mut manager, worker, iteration)?,
        }
    }

    if options.workspace.is_some() {
        manager.destroy_workspace(&name)?;
    }
    tracing::trace!(worker, device, buffers = summary.buffers, "worker finished");
    Ok(summary)
}

fn run_iteration(manager: &mut WorkspaceManager, worker: usize, iteration: usize) -> Result<WorkloadSummary> {
    let mut points = Vec::with_capacity(BUFFERS_PER_ITERATION);
    let mut summary = WorkloadSummary::default();
    for index in 0..BUFFERS_PER_ITERATION {
        let shape = buffer_shape(worker, iteration, index);
        let point = manager.allocate(&shape)?;
        summary.buffers += 1;
        summary.requested_bytes += shape.number_of_bytes();
        if point.is_borrowed() {
            summary.borrowed += 1;
        }
        points.push(point);
    }
    for point in &mut points {
        manager.release(point)?;
    }
    Ok(summary)
}

fn duration_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
