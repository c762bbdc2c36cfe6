//! Run configuration, resolved from the command line.

use crate::accumulator::MergePolicy;
use crate::cli::Cli;
use crate::error::{MxpoolError, Result};
use crate::matrix::DEFAULT_DIM;
use crate::worker::{DispatchPolicy, pool_size};
use clap::ValueEnum;
use serde::Serialize;
use std::path::PathBuf;

/// Execution backend for workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// One subprocess per (weight, row), talking over pipes.
    #[default]
    Process,
    /// One thread per (weight, row, col), sharing the accumulator.
    Thread,
}

/// Everything the worker pool needs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub backend: Backend,
    pub policy: MergePolicy,
    pub dim: usize,
    /// Directory holding every worker's `.out` and `.err` sinks.
    pub log_dir: PathBuf,
    pub dispatch: DispatchPolicy,
    /// Binary re-executed for process workers.
    pub worker_exe: PathBuf,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            policy: MergePolicy::default(),
            dim: DEFAULT_DIM,
            log_dir: PathBuf::from("."),
            dispatch: DispatchPolicy::default(),
            worker_exe: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("mxpool")),
        }
    }
}

/// One coordinator run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Startup item (the first matrix A).
    pub input: PathBuf,
    /// Weight matrices, in worker order.
    pub weights: Vec<PathBuf>,
    pub bias: Option<PathBuf>,
    /// Read further items from the input stream after the startup item.
    pub stream: bool,
    /// Chained summation: each round's result is the next round's input,
    /// and stream lines name weight matrices.
    pub chain: bool,
    pub pool: PoolConfig,
}

impl RunConfig {
    /// Build from parsed arguments. Positional files are `A W1 [W2 ...]`.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let (input, weights) = match cli.files.split_first() {
            Some((input, weights)) if !weights.is_empty() => (input.clone(), weights.to_vec()),
            _ => {
                return Err(MxpoolError::Argument(
                    "expecting at least 2 files as input".into(),
                ));
            }
        };

        let config = Self {
            input,
            weights,
            bias: cli.bias.clone(),
            stream: !cli.once,
            chain: cli.chain,
            pool: PoolConfig {
                backend: cli.backend,
                policy: cli.policy,
                dim: cli.dim,
                log_dir: cli.log_dir.clone(),
                dispatch: cli
                    .only_worker
                    .map_or(DispatchPolicy::Broadcast, DispatchPolicy::Designated),
                ..PoolConfig::default()
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Number of workers this run will spawn.
    pub fn worker_count(&self) -> usize {
        pool_size(self.pool.backend, self.weights.len(), self.pool.dim)
    }

    /// Reject configurations no run could satisfy.
    pub fn validate(&self) -> Result<()> {
        if self.weights.is_empty() {
            return Err(MxpoolError::Argument(
                "expecting at least 2 files as input".into(),
            ));
        }
        if self.pool.dim == 0 {
            return Err(MxpoolError::Argument(
                "matrix dimension must be at least 1".into(),
            ));
        }
        if self.pool.policy == MergePolicy::Place && self.weights.len() > 1 {
            return Err(MxpoolError::Argument(format!(
                "place policy takes exactly one weight matrix, got {}",
                self.weights.len()
            )));
        }
        if self.chain && self.pool.policy != MergePolicy::Sum {
            return Err(MxpoolError::Argument(
                "--chain requires the sum policy".into(),
            ));
        }
        if self.chain && self.pool.dispatch != DispatchPolicy::Broadcast {
            return Err(MxpoolError::Argument(
                "--chain cannot be combined with --only-worker".into(),
            ));
        }
        if let DispatchPolicy::Designated(index) = self.pool.dispatch
            && index >= self.worker_count()
        {
            return Err(MxpoolError::Argument(format!(
                "--only-worker {} is out of range (pool has {} workers)",
                index,
                self.worker_count()
            )));
        }
        Ok(())
    }
}
