//! Streaming coordinator.
//!
//! Runs the startup item, then every item named on the input stream, one
//! iteration at a time: begin the iteration in the accumulator, dispatch,
//! collect, merge. At end of stream the pool is torn down and the
//! accumulator finalized.
//!
//! Chained summation runs a sequence of rounds instead, each with its own
//! pool, feeding every round's `rSum` into the next.

use crate::accumulator::{Accumulator, FinalState, MergePolicy, SharedAccumulator, UnsetRow};
use crate::config::{Backend, RunConfig};
use crate::error::{MxpoolError, Result};
use crate::lifecycle::LifecycleRecord;
use crate::matrix::Matrix;
use crate::worker::{
    DispatchPolicy, Origin, WIRE_VERSION, WorkItem, WorkerPool, plan_workers,
};
use serde::Serialize;
use std::fs::File;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Outcome of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub backend: Backend,
    pub dim: usize,
    pub iterations: u32,
    /// Item sources in iteration order.
    pub inputs: Vec<String>,
    /// Weight matrices given on the command line, in weight-index order.
    pub weights: Vec<String>,
    #[serde(flatten)]
    pub state: FinalState,
    pub unset_rows: Vec<UnsetRow>,
    pub workers: Vec<LifecycleRecord>,
}

/// What either kind of run hands back before the report is assembled.
struct Outcome {
    iterations: u32,
    inputs: Vec<String>,
    state: FinalState,
    unset_rows: Vec<UnsetRow>,
    workers: Vec<LifecycleRecord>,
}

/// Execute a run. `stream` supplies further item file names, one or more
/// per line, and is only read when `config.stream` is set. In a chained
/// run each line names the weight matrices of one more round instead.
///
/// Every weight matrix must open before any worker starts. Once a pool
/// exists it is always torn down, even when an item fails to load.
pub fn run<R: BufRead>(config: &RunConfig, stream: R) -> Result<RunReport> {
    let run_start = Instant::now();
    config.validate()?;
    let dim = config.pool.dim;

    open_all(&config.weights)?;
    let bias = config
        .bias
        .as_deref()
        .map(|path| Matrix::load(path, dim))
        .transpose()?;
    let first = Matrix::load(&config.input, dim)?;

    info!(
        backend = ?config.pool.backend,
        policy = ?config.pool.policy,
        chain = config.chain,
        dim,
        weights = config.weights.len(),
        wire_version = WIRE_VERSION,
        "Starting run"
    );

    let outcome = if config.chain {
        run_chained(config, first, bias.as_ref(), stream)?
    } else {
        run_streamed(config, first, bias.as_ref(), stream)?
    };

    if !outcome.unset_rows.is_empty() {
        warn!(
            rows = outcome.unset_rows.len(),
            "Some result rows were never delivered"
        );
    }
    info!(
        iterations = outcome.iterations,
        workers = outcome.workers.len(),
        run_time_ms = run_start.elapsed().as_millis(),
        "Run complete"
    );

    Ok(RunReport {
        backend: config.pool.backend,
        dim,
        iterations: outcome.iterations,
        inputs: outcome.inputs,
        weights: config
            .weights
            .iter()
            .map(|path| path.display().to_string())
            .collect(),
        state: outcome.state,
        unset_rows: outcome.unset_rows,
        workers: outcome.workers,
    })
}

fn open_all(paths: &[PathBuf]) -> Result<()> {
    for path in paths {
        File::open(path).map_err(|e| MxpoolError::file_open(path, e))?;
    }
    Ok(())
}

/// One pool for the whole run; every item goes through it.
fn run_streamed<R: BufRead>(
    config: &RunConfig,
    first: Matrix,
    bias: Option<&Matrix>,
    stream: R,
) -> Result<Outcome> {
    let shared = SharedAccumulator::new(Accumulator::new(
        config.pool.policy,
        config.pool.dim,
        config.weights.len(),
    )?);
    let plans = plan_workers(config.pool.backend, &config.weights, config.pool.dim);
    let mut pool = WorkerPool::spawn(&config.pool, plans, &shared)?;

    let mut inputs = Vec::new();
    let driven = drive(config, &mut pool, &shared, first, stream, &mut inputs);
    let workers = pool.teardown();
    drop(pool);
    driven?;

    let finalized = shared.finish(bias)?;
    Ok(Outcome {
        iterations: finalized.iterations,
        inputs,
        state: finalized.state,
        unset_rows: finalized.unset_rows,
        workers,
    })
}

/// Feed the startup item, then the stream, through the pool.
fn drive<R: BufRead>(
    config: &RunConfig,
    pool: &mut WorkerPool,
    shared: &SharedAccumulator,
    first: Matrix,
    stream: R,
    inputs: &mut Vec<String>,
) -> Result<()> {
    let source = config.input.display().to_string();
    iterate(
        pool,
        shared,
        config.pool.dispatch,
        WorkItem::new(0, first, source.clone()),
    )?;
    inputs.push(source);

    if !config.stream {
        return Ok(());
    }

    let mut sequence: u32 = 1;
    for line in stream.lines() {
        let line = line?;
        for token in line.split_whitespace() {
            let matrix = Matrix::load(Path::new(token), config.pool.dim)?;
            iterate(
                pool,
                shared,
                config.pool.dispatch,
                WorkItem::new(sequence, matrix, token),
            )?;
            inputs.push(token.to_string());
            sequence += 1;
        }
    }
    debug!(items = inputs.len(), "Input stream exhausted");
    Ok(())
}

/// Running state of a chained summation.
struct Chain {
    rsum: Matrix,
    inputs: Vec<String>,
    unset_rows: Vec<UnsetRow>,
    workers: Vec<LifecycleRecord>,
    /// First pool index of the next round.
    next_index: usize,
}

impl Chain {
    /// One round: `rsum = Σ_i rsum · weights[i]` on a fresh pool.
    #[instrument(level = "debug", skip_all, fields(round = self.inputs.len(), weights = weights.len()))]
    fn round(&mut self, config: &RunConfig, weights: &[PathBuf], label: String) -> Result<()> {
        let round = self.inputs.len() as u32;
        let dim = config.pool.dim;
        open_all(weights)?;

        let shared =
            SharedAccumulator::new(Accumulator::new(MergePolicy::Sum, dim, weights.len())?);
        let mut plans = plan_workers(config.pool.backend, weights, dim);
        for plan in &mut plans {
            plan.index += self.next_index;
        }
        self.next_index += plans.len();
        let mut pool = WorkerPool::spawn(&config.pool, plans, &shared)?;

        let item = WorkItem::new(0, self.rsum.clone(), label.clone());
        let driven = iterate(&mut pool, &shared, DispatchPolicy::Broadcast, item);
        self.workers.extend(pool.teardown());
        drop(pool);
        driven?;

        let finalized = shared.finish(None)?;
        let FinalState::Sum(rsum) = finalized.state else {
            return Err(MxpoolError::Merge("chained round did not produce a sum".into()));
        };
        self.rsum = rsum;
        self.unset_rows
            .extend(finalized.unset_rows.into_iter().map(|unset| UnsetRow {
                sequence: Some(round),
                ..unset
            }));
        self.inputs.push(label);
        Ok(())
    }
}

/// Round 0 uses the command-line weights; each non-blank stream line names
/// the weights of the next round.
fn run_chained<R: BufRead>(
    config: &RunConfig,
    first: Matrix,
    bias: Option<&Matrix>,
    stream: R,
) -> Result<Outcome> {
    let mut chain = Chain {
        rsum: first,
        inputs: Vec::new(),
        unset_rows: Vec::new(),
        workers: Vec::new(),
        next_index: 0,
    };

    chain.round(config, &config.weights, config.input.display().to_string())?;
    if config.stream {
        for line in stream.lines() {
            let line = line?;
            let weights: Vec<PathBuf> = line.split_whitespace().map(PathBuf::from).collect();
            if weights.is_empty() {
                continue;
            }
            chain.round(config, &weights, line.trim().to_string())?;
        }
    }

    let mut rsum = chain.rsum;
    if let Some(bias) = bias {
        rsum.add_assign(bias);
    }
    Ok(Outcome {
        iterations: chain.inputs.len() as u32,
        inputs: chain.inputs,
        state: FinalState::Sum(rsum),
        unset_rows: chain.unset_rows,
        workers: chain.workers,
    })
}

/// One iteration. Returns only after every dispatched worker has answered
/// or gone away.
#[instrument(level = "debug", skip_all, fields(sequence = item.sequence))]
fn iterate(
    pool: &mut WorkerPool,
    shared: &SharedAccumulator,
    policy: DispatchPolicy,
    item: WorkItem,
) -> Result<()> {
    let iteration_start = Instant::now();
    let sequence = item.sequence;
    let source = item.source.clone();

    shared.begin_iteration(sequence)?;
    let accepted = pool.dispatch(item, policy)?;
    let partials = pool.collect();

    // Cell results were merged by the thread workers themselves
    for partial in partials
        .iter()
        .filter(|p| matches!(p.origin, Origin::Row { .. }))
    {
        if let Err(e) = shared.merge(partial) {
            warn!(origin = ?partial.origin, error = %e, "Discarding worker result");
        }
    }

    pool.annotate(&format!("input {}: {}", sequence, source));

    if partials.len() < accepted {
        warn!(
            sequence,
            missing = accepted - partials.len(),
            "Iteration finished with missing results"
        );
    }
    info!(
        sequence,
        source = %source,
        results = partials.len(),
        iteration_time_ms = iteration_start.elapsed().as_millis(),
        "Iteration complete"
    );
    Ok(())
}
