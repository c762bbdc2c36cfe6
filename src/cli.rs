//! Command-line interface definitions using clap.

use crate::accumulator::MergePolicy;
use crate::config::Backend;
use crate::error::{MxpoolError, Result};
use crate::logging::{LogConfig, LogFormat};
use crate::matrix::DEFAULT_DIM;
use crate::output::OutputFormat;
use crate::worker::WorkerStartup;
use clap::Parser;
use std::path::PathBuf;

/// Streams input matrices through a pool of workers computing A × W.
#[derive(Parser, Debug)]
#[command(name = "mxpool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Input matrix A followed by one or more weight matrices W.
    ///
    /// After A, further input matrices are read as file names from stdin,
    /// one or more per line, until EOF.
    #[arg(value_name = "FILE")]
    pub files: Vec<PathBuf>,

    /// Worker backend.
    #[arg(long, value_enum, env = "MXPOOL_BACKEND", default_value_t = Backend::Process)]
    pub backend: Backend,

    /// How partial results are merged.
    #[arg(long, value_enum, env = "MXPOOL_POLICY", default_value_t = MergePolicy::History)]
    pub policy: MergePolicy,

    /// Matrix dimension N. Shorter input is zero-padded, longer input truncated.
    #[arg(long, default_value_t = DEFAULT_DIM)]
    pub dim: usize,

    /// Bias matrix added once to every result.
    #[arg(long, value_name = "FILE")]
    pub bias: Option<PathBuf>,

    /// Directory for per-worker `.out` / `.err` logs.
    #[arg(long, env = "MXPOOL_LOG_DIR", default_value = ".")]
    pub log_dir: PathBuf,

    /// Send every item to this worker only instead of broadcasting.
    #[arg(long, value_name = "INDEX")]
    pub only_worker: Option<usize>,

    /// Process only A; do not read further inputs from stdin.
    #[arg(long)]
    pub once: bool,

    /// Feed each round's rSum back as the next round's input (sum policy).
    ///
    /// Stdin lines then name the weight matrices of each further round.
    #[arg(long)]
    pub chain: bool,

    /// Output format for the final result.
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Plain)]
    pub format: OutputFormat,

    /// Enable verbose output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all diagnostics except errors.
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log level (error, warn, info, debug, trace). Overrides -v/-q.
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Log format.
    #[arg(long, value_enum, value_name = "FORMAT")]
    pub log_format: Option<LogFormat>,

    /// Also write diagnostics to this file.
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Run as a worker subprocess (internal use).
    #[arg(long, hide = true)]
    pub internal_worker: bool,

    #[arg(long, hide = true, requires = "internal_worker")]
    pub worker_index: Option<usize>,

    #[arg(long, hide = true, requires = "internal_worker")]
    pub weights: Option<PathBuf>,

    #[arg(long, hide = true, requires = "internal_worker")]
    pub row: Option<usize>,

    #[arg(long, hide = true, requires = "internal_worker")]
    pub inbound_fd: Option<i32>,

    #[arg(long, hide = true, requires = "internal_worker")]
    pub outbound_fd: Option<i32>,
}

impl Cli {
    /// Diagnostics configuration. Flags win over environment variables.
    pub fn log_config(&self) -> LogConfig {
        let mut config = LogConfig::for_cli();

        if let Some(level) = &self.log_level {
            config = config.with_filter(level.clone());
        } else if self.quiet {
            config = config.with_filter("error");
        } else if self.verbose > 0 {
            let level = match self.verbose {
                1 => "info",
                2 => "debug",
                _ => "trace",
            };
            config = config.with_filter(level).with_span_events(self.verbose > 2);
        }

        config = config.with_env_overrides();

        if let Some(format) = self.log_format {
            config = config.with_format(format);
        }
        if let Some(path) = &self.log_file {
            config = config.with_file(path.clone());
        }
        config
    }

    /// Worker startup configuration from the hidden worker flags.
    pub fn worker_startup(&self) -> Result<WorkerStartup> {
        fn required<T: Clone>(value: &Option<T>, flag: &str) -> Result<T> {
            value
                .clone()
                .ok_or_else(|| MxpoolError::Argument(format!("worker mode requires {}", flag)))
        }

        Ok(WorkerStartup {
            index: required(&self.worker_index, "--worker-index")?,
            weights: required(&self.weights, "--weights")?,
            row: required(&self.row, "--row")?,
            dim: self.dim,
            log_dir: self.log_dir.clone(),
            inbound_fd: self.inbound_fd.unwrap_or(crate::worker::INBOUND_FD),
            outbound_fd: self.outbound_fd.unwrap_or(crate::worker::OUTBOUND_FD),
        })
    }
}
