//! Per-worker lifecycle logs.
//!
//! Every worker owns two sinks in the log directory, `<id>.out` and
//! `<id>.err`. The worker creates them at startup; afterwards the
//! coordinator only ever appends (input metadata while running, the exit
//! record after reaping). Sinks are never deleted.

use crate::error::{MxpoolError, Result};
use crate::worker::Disposition;
use serde::{Serialize, Serializer};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Stable identity of a worker, used as its sink file stem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerIdentity {
    /// Out-of-process worker, by OS pid.
    Process(i32),
    /// In-process worker thread, by owning pid and pool index.
    Thread { parent: u32, index: usize },
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process(pid) => write!(f, "{}", pid),
            Self::Thread { parent, index } => write!(f, "{}-t{}", parent, index),
        }
    }
}

impl Serialize for WorkerIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Paths of the `.out` and `.err` sinks for `identity`.
pub fn sink_paths(dir: &Path, identity: WorkerIdentity) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("{}.out", identity)),
        dir.join(format!("{}.err", identity)),
    )
}

/// A worker's own handles on its two sinks.
pub struct LogSink {
    identity: WorkerIdentity,
    out: File,
    err: File,
}

impl LogSink {
    /// Create (or truncate) both sinks and reopen them for appending.
    pub fn create(dir: &Path, identity: WorkerIdentity) -> Result<Self> {
        let (out_path, err_path) = sink_paths(dir, identity);
        Ok(Self {
            identity,
            out: create_append(&out_path)?,
            err: create_append(&err_path)?,
        })
    }

    /// Write `Starting command <n>: child <id> pid of parent <ppid>`.
    pub fn start_record(&mut self, command: usize, parent: u32) -> Result<()> {
        writeln!(
            self.out,
            "Starting command {}: child {} pid of parent {}",
            command, self.identity, parent
        )?;
        self.out.flush()?;
        Ok(())
    }

    pub fn out(&mut self) -> &mut File {
        &mut self.out
    }

    pub fn err(&mut self) -> &mut File {
        &mut self.err
    }

    /// Give up the handles, e.g. to bind them to the process's stdout and stderr.
    pub fn into_files(self) -> (File, File) {
        (self.out, self.err)
    }
}

fn create_append(path: &Path) -> Result<File> {
    File::create(path).map_err(|e| MxpoolError::file_open(path, e))?;
    OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(|e| MxpoolError::file_open(path, e))
}

fn open_existing(dir: &Path, identity: WorkerIdentity) -> Result<File> {
    let (out_path, _) = sink_paths(dir, identity);
    OpenOptions::new()
        .append(true)
        .open(&out_path)
        .map_err(|e| MxpoolError::file_open(&out_path, e))
}

/// Append the exit record to an existing `.out` sink.
///
/// Does not create the file: a worker that never got as far as creating
/// its sink has nothing to append to.
pub fn append_exit(
    dir: &Path,
    identity: WorkerIdentity,
    parent: u32,
    disposition: Disposition,
) -> Result<()> {
    let mut out = open_existing(dir, identity)?;
    write!(
        out,
        "Finished child {} pid of parent {}\n{}\n",
        identity, parent, disposition
    )?;
    Ok(())
}

/// Append one metadata line to an existing `.out` sink.
pub fn append_metadata(dir: &Path, identity: WorkerIdentity, text: &str) -> Result<()> {
    let mut out = open_existing(dir, identity)?;
    writeln!(out, "{}", text)?;
    Ok(())
}

/// What the coordinator knows about a worker after reaping it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleRecord {
    pub worker: WorkerIdentity,
    pub parent: u32,
    pub disposition: Disposition,
}
