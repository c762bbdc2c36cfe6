//! Worker pool for streaming matrix products.
//!
//! Owns every worker for the lifetime of a run. One iteration is
//! `dispatch` followed by `collect`; the coordinator never dispatches the
//! next item before the previous `collect` has returned.

use super::disposition::Disposition;
use super::proc::Proc;
use super::protocol::{Origin, PartialResult, WorkItem};
use super::spawn::{WorkerConfig, spawn_worker};
use super::thread::{ThreadConfig, ThreadUnit, spawn_thread_worker};
use crate::accumulator::SharedAccumulator;
use crate::config::{Backend, PoolConfig};
use crate::error::{MxpoolError, Result};
use crate::lifecycle::{self, LifecycleRecord, WorkerIdentity};
use crate::matrix::Matrix;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, trace, warn};

/// The part of the product one worker owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shard {
    /// A full output row (process backend).
    Row(usize),
    /// A single output cell (thread backend).
    Cell(usize, usize),
}

impl Shard {
    pub fn row(&self) -> usize {
        match *self {
            Self::Row(row) | Self::Cell(row, _) => row,
        }
    }
}

/// Per-worker configuration decided before spawning.
#[derive(Debug, Clone)]
pub struct WorkerPlan {
    pub index: usize,
    pub weight: usize,
    pub weights: PathBuf,
    pub shard: Shard,
}

impl WorkerPlan {
    fn origin(&self) -> Origin {
        match self.shard {
            Shard::Row(row) => Origin::Row {
                weight: self.weight,
                row,
            },
            Shard::Cell(row, col) => Origin::Cell {
                weight: self.weight,
                row,
                col,
            },
        }
    }
}

/// Lay out workers: one per (weight, row) for processes, one per
/// (weight, row, col) for threads. Indices are dense and in that order.
pub fn plan_workers(backend: Backend, weights: &[PathBuf], dim: usize) -> Vec<WorkerPlan> {
    let mut plans = Vec::new();
    for (weight, path) in weights.iter().enumerate() {
        for row in 0..dim {
            let shards: Vec<Shard> = match backend {
                Backend::Process => vec![Shard::Row(row)],
                Backend::Thread => (0..dim).map(|col| Shard::Cell(row, col)).collect(),
            };
            for shard in shards {
                plans.push(WorkerPlan {
                    index: plans.len(),
                    weight,
                    weights: path.clone(),
                    shard,
                });
            }
        }
    }
    plans
}

/// Number of workers `plan_workers` lays out.
pub fn pool_size(backend: Backend, weights: usize, dim: usize) -> usize {
    match backend {
        Backend::Process => weights * dim,
        Backend::Thread => weights * dim * dim,
    }
}

/// Which workers receive an item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DispatchPolicy {
    /// Every worker in the pool.
    #[default]
    Broadcast,
    /// Only the worker at this pool index.
    Designated(usize),
}

enum Unit {
    Process(Proc),
    Thread(ThreadUnit),
}

/// A single worker in the pool.
struct Worker {
    identity: WorkerIdentity,
    plan: WorkerPlan,
    unit: Unit,
    /// Dispatched to in the current iteration and not yet collected.
    pending: bool,
}

impl Worker {
    fn is_open(&self) -> bool {
        match &self.unit {
            Unit::Process(proc) => proc.is_inbound_open(),
            Unit::Thread(thread) => thread.is_inbound_open(),
        }
    }

    fn close_inbound(&mut self) {
        match &mut self.unit {
            Unit::Process(proc) => proc.close_inbound(),
            Unit::Thread(thread) => thread.close_inbound(),
        }
    }

    fn send(&mut self, frame: &[u8], item: &Arc<WorkItem>) -> Result<()> {
        match &mut self.unit {
            Unit::Process(proc) => proc.send(frame).map_err(MxpoolError::from),
            Unit::Thread(thread) => thread.send(Arc::clone(item)),
        }
    }

    /// Next result, or `None` if the worker's outbound channel is gone.
    fn recv(&mut self) -> Result<Option<PartialResult>> {
        match &mut self.unit {
            Unit::Process(proc) => {
                let Some(frame) = proc.recv()? else {
                    return Ok(None);
                };
                if frame.origin != self.plan.index as i32 {
                    return Err(MxpoolError::Protocol(format!(
                        "worker {} answered as worker {}",
                        self.plan.index, frame.origin
                    )));
                }
                Ok(Some(PartialResult {
                    origin: self.plan.origin(),
                    sequence: frame.sequence,
                    vector: frame.vector,
                }))
            }
            Unit::Thread(thread) => Ok(thread.recv()),
        }
    }

    fn wait(&mut self) -> Result<Disposition> {
        match &mut self.unit {
            Unit::Process(proc) => proc.wait(),
            Unit::Thread(thread) => Ok(thread.join()),
        }
    }
}

/// A pool of workers for one run.
pub struct WorkerPool {
    workers: Vec<Worker>,
    backend: Backend,
    log_dir: PathBuf,
    parent: u32,
}

impl WorkerPool {
    /// Spawn one worker per plan.
    ///
    /// On any failure the workers started so far are closed, reaped and
    /// logged before the error is returned.
    #[instrument(level = "debug", skip_all, fields(backend = ?config.backend, workers = plans.len()))]
    pub fn spawn(
        config: &PoolConfig,
        plans: Vec<WorkerPlan>,
        shared: &SharedAccumulator,
    ) -> Result<Self> {
        let spawn_start = Instant::now();
        tracing::info!(
            workers = plans.len(),
            backend = ?config.backend,
            dim = config.dim,
            "Initializing worker pool"
        );

        let mut pool = Self {
            workers: Vec::with_capacity(plans.len()),
            backend: config.backend,
            log_dir: config.log_dir.clone(),
            parent: std::process::id(),
        };

        let preloaded = match config.backend {
            Backend::Thread => preload_weights(&plans, config.dim),
            Backend::Process => Vec::new(),
        };

        for plan in plans {
            let started = match config.backend {
                Backend::Process => spawn_process(config, &plan),
                Backend::Thread => {
                    let weights = preloaded
                        .get(plan.weight)
                        .cloned()
                        .unwrap_or_else(|| Err("weight matrix was not loaded".to_string()));
                    spawn_thread(config, &plan, weights, shared)
                }
            };

            match started {
                Ok((identity, unit)) => {
                    trace!(worker_id = %identity, index = plan.index, shard = ?plan.shard, "Worker started");
                    pool.workers.push(Worker {
                        identity,
                        plan,
                        unit,
                        pending: false,
                    });
                }
                Err(e) => {
                    warn!(index = plan.index, error = %e, "Worker failed to spawn; tearing down pool");
                    pool.teardown();
                    return Err(e);
                }
            }
        }

        tracing::info!(
            workers = pool.workers.len(),
            spawn_time_ms = spawn_start.elapsed().as_millis(),
            "All workers started"
        );
        Ok(pool)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Identities in pool order.
    pub fn identities(&self) -> Vec<WorkerIdentity> {
        self.workers.iter().map(|w| w.identity).collect()
    }

    /// Send `item` to the workers selected by `policy`.
    ///
    /// A worker whose channel is broken is logged and closed; its result
    /// stays missing. Returns the number of workers that accepted the item.
    pub fn dispatch(&mut self, item: WorkItem, policy: DispatchPolicy) -> Result<usize> {
        if let DispatchPolicy::Designated(index) = policy
            && index >= self.workers.len()
        {
            return Err(MxpoolError::Argument(format!(
                "worker {} does not exist (pool has {} workers)",
                index,
                self.workers.len()
            )));
        }

        let frame = match self.backend {
            Backend::Process => item.encode(),
            Backend::Thread => Vec::new(),
        };
        let item = Arc::new(item);
        let mut accepted = 0;

        for worker in &mut self.workers {
            let selected = match policy {
                DispatchPolicy::Broadcast => true,
                DispatchPolicy::Designated(index) => worker.plan.index == index,
            };
            if !selected || !worker.is_open() {
                continue;
            }
            match worker.send(&frame, &item) {
                Ok(()) => {
                    worker.pending = true;
                    accepted += 1;
                    trace!(worker_id = %worker.identity, sequence = item.sequence, "Dispatched");
                }
                Err(e) => {
                    warn!(
                        worker_id = %worker.identity,
                        sequence = item.sequence,
                        error = %e,
                        "Worker channel broken; its result will be missing"
                    );
                    worker.close_inbound();
                }
            }
        }

        debug!(sequence = item.sequence, accepted, "Item dispatched");
        Ok(accepted)
    }

    /// Block until every worker dispatched to in this iteration has answered
    /// or reached EOF.
    pub fn collect(&mut self) -> Vec<PartialResult> {
        let collect_start = Instant::now();
        let mut results = Vec::new();

        for worker in self.workers.iter_mut().filter(|w| w.pending) {
            worker.pending = false;
            match worker.recv() {
                Ok(Some(partial)) => results.push(partial),
                Ok(None) => {
                    warn!(worker_id = %worker.identity, "Worker closed its channel; result missing");
                    worker.close_inbound();
                }
                Err(e) => {
                    warn!(worker_id = %worker.identity, error = %e, "Unreadable worker result; result missing");
                    worker.close_inbound();
                }
            }
        }

        trace!(
            results = results.len(),
            collect_time_ms = collect_start.elapsed().as_millis(),
            "Iteration collected"
        );
        results
    }

    /// Append a metadata line to every worker's `.out` sink.
    ///
    /// Workers that never created their sink are skipped.
    pub fn annotate(&self, text: &str) {
        for worker in &self.workers {
            if let Err(e) = lifecycle::append_metadata(&self.log_dir, worker.identity, text) {
                debug!(worker_id = %worker.identity, error = %e, "Skipping metadata");
            }
        }
    }

    /// Close every inbound channel, reap every worker and append its exit
    /// record.
    pub fn teardown(&mut self) -> Vec<LifecycleRecord> {
        let mut workers = std::mem::take(&mut self.workers);
        for worker in &mut workers {
            worker.close_inbound();
        }

        let mut records = Vec::with_capacity(workers.len());
        for worker in &mut workers {
            let disposition = match worker.wait() {
                Ok(disposition) => disposition,
                Err(e) => {
                    warn!(worker_id = %worker.identity, error = %e, "Could not reap worker");
                    continue;
                }
            };
            if !disposition.is_success() {
                warn!(worker_id = %worker.identity, %disposition, "Worker ended abnormally");
            }
            if let Err(e) =
                lifecycle::append_exit(&self.log_dir, worker.identity, self.parent, disposition)
            {
                warn!(worker_id = %worker.identity, error = %e, "Could not append exit record");
            }
            records.push(LifecycleRecord {
                worker: worker.identity,
                parent: self.parent,
                disposition,
            });
        }

        tracing::info!(workers = records.len(), "Worker pool torn down");
        records
    }
}

fn spawn_process(config: &PoolConfig, plan: &WorkerPlan) -> Result<(WorkerIdentity, Unit)> {
    let proc = spawn_worker(
        &config.worker_exe,
        &WorkerConfig {
            index: plan.index,
            weights: plan.weights.clone(),
            row: plan.shard.row(),
            dim: config.dim,
            log_dir: config.log_dir.clone(),
        },
    )?;
    Ok((
        WorkerIdentity::Process(proc.pid().as_raw()),
        Unit::Process(proc),
    ))
}

fn spawn_thread(
    config: &PoolConfig,
    plan: &WorkerPlan,
    weights: std::result::Result<Arc<Matrix>, String>,
    shared: &SharedAccumulator,
) -> Result<(WorkerIdentity, Unit)> {
    let Shard::Cell(row, col) = plan.shard else {
        return Err(MxpoolError::SpawnFailure {
            index: plan.index,
            reason: "thread workers own a single cell".into(),
        });
    };
    let unit = spawn_thread_worker(
        ThreadConfig {
            index: plan.index,
            weight: plan.weight,
            row,
            col,
            dim: config.dim,
            log_dir: config.log_dir.clone(),
            weights,
        },
        shared.clone(),
    )?;
    Ok((unit.identity(), Unit::Thread(unit)))
}

/// Load each weight matrix once for all thread workers that share it.
///
/// A load failure is kept per matrix and becomes a startup failure of the
/// workers bound to it.
fn preload_weights(
    plans: &[WorkerPlan],
    dim: usize,
) -> Vec<std::result::Result<Arc<Matrix>, String>> {
    let mut paths: Vec<&Path> = Vec::new();
    for plan in plans {
        if plan.weight == paths.len() {
            paths.push(&plan.weights);
        }
    }
    paths
        .into_iter()
        .map(|path| {
            Matrix::load(path, dim)
                .map(Arc::new)
                .map_err(|e| e.to_string())
        })
        .collect()
}
