//! Worker subprocess spawning.
//!
//! Workers are re-executions of the current binary in `--internal-worker`
//! mode. Everything a worker needs is declared on its command line; the
//! parent's environment carries no worker configuration.

use super::proc::Proc;
use crate::error::{MxpoolError, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Inbound channel descriptor as seen by the worker.
pub const INBOUND_FD: i32 = 0;
/// Outbound channel descriptor as seen by the worker.
pub const OUTBOUND_FD: i32 = 1;

/// Startup configuration of one process worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Position in the pool. Also the `origin` of every result frame.
    pub index: usize,
    /// Weight matrix the worker multiplies by.
    pub weights: PathBuf,
    /// Output row the worker owns.
    pub row: usize,
    pub dim: usize,
    pub log_dir: PathBuf,
}

impl WorkerConfig {
    /// Command-line arguments that start this worker.
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--internal-worker".into(),
            "--worker-index".into(),
            self.index.to_string().into(),
            "--weights".into(),
            self.weights.clone().into(),
            "--row".into(),
            self.row.to_string().into(),
            "--dim".into(),
            self.dim.to_string().into(),
            "--log-dir".into(),
            self.log_dir.clone().into(),
        ];
        args.extend([
            "--inbound-fd".into(),
            INBOUND_FD.to_string().into(),
            "--outbound-fd".into(),
            OUTBOUND_FD.to_string().into(),
        ]);
        args
    }
}

/// Spawn a worker subprocess.
///
/// # Arguments
/// * `exe` - Binary to run; normally the current executable
/// * `config` - Worker configuration
///
/// # Returns
/// A `Proc` handle for communicating with the worker.
pub fn spawn_worker(exe: &Path, config: &WorkerConfig) -> Result<Proc> {
    let mut cmd = Command::new(exe);
    cmd.args(config.to_args());

    // Channels on stdin/stdout; the worker rebinds stderr to its own sink
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::inherit());

    let child = cmd.spawn().map_err(|e| MxpoolError::SpawnFailure {
        index: config.index,
        reason: e.to_string(),
    })?;

    Proc::from_child(child, config.dim)
}
