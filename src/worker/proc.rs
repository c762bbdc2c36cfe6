//! Process handle for worker subprocesses.
//!
//! Wraps a child process with its two frame channels.

use super::disposition::{Disposition, analyze_wait_status};
use super::ipc::{FrameReader, FrameWriter, PipeFd};
use super::protocol::{ResultFrame, outbound_frame_len};
use crate::error::{MxpoolError, Result};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::io;
use std::os::fd::OwnedFd;
use std::time::Duration;

/// Handle to a worker subprocess with IPC channels.
pub struct Proc {
    pid: Pid,
    dim: usize,
    /// Inbound channel. `None` once closed; closing is what tells the
    /// worker to finish.
    writer: Option<FrameWriter>,
    reader: FrameReader,
    reaped: bool,
}

impl Proc {
    /// Create a new process handle from its components.
    ///
    /// # Arguments
    /// * `pid` - The process ID
    /// * `stdin` - File descriptor for writing to the worker's stdin
    /// * `stdout` - File descriptor for reading from the worker's stdout
    /// * `dim` - Matrix dimension, which fixes both frame sizes
    pub fn new(pid: Pid, stdin: PipeFd, stdout: PipeFd, dim: usize) -> Self {
        Self {
            pid,
            dim,
            writer: Some(FrameWriter::new(stdin)),
            reader: FrameReader::new(stdout, outbound_frame_len(dim)),
            reaped: false,
        }
    }

    /// Create from a spawned `std::process::Child`.
    ///
    /// Takes ownership of the child's stdin and stdout.
    pub fn from_child(mut child: std::process::Child, dim: usize) -> Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| MxpoolError::Worker("Child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MxpoolError::Worker("Child stdout not captured".into()))?;

        Ok(Self::new(
            pid,
            PipeFd::new(OwnedFd::from(stdin)),
            PipeFd::new(OwnedFd::from(stdout)),
            dim,
        ))
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn is_inbound_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Send one inbound frame.
    ///
    /// Fails with `BrokenPipe` if the channel was already closed.
    pub fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.write_frame(frame),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "inbound channel already closed",
            )),
        }
    }

    /// Receive one result frame.
    ///
    /// Returns `None` if the worker closed its stdout (EOF).
    pub fn recv(&mut self) -> Result<Option<ResultFrame>> {
        match self.reader.read_frame() {
            Ok(Some(frame)) => Ok(Some(ResultFrame::decode(self.dim, frame)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(MxpoolError::Protocol(format!(
                "Failed to receive from worker {}: {}",
                self.pid, e
            ))),
        }
    }

    /// Close the inbound channel. Closing twice is a no-op.
    pub fn close_inbound(&mut self) {
        self.writer.take();
    }

    /// Wait for the process to reach a terminal state (blocking).
    pub fn wait(&mut self) -> Result<Disposition> {
        if self.reaped {
            return Err(MxpoolError::Worker("Process already reaped".into()));
        }
        loop {
            match waitpid(self.pid, None) {
                Ok(status) => {
                    if let Some(disposition) = analyze_wait_status(status) {
                        self.reaped = true;
                        return Ok(disposition);
                    }
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(MxpoolError::Worker(format!("waitpid failed: {}", e))),
            }
        }
    }

    /// Try to wait for the process (non-blocking).
    ///
    /// Returns `None` if the process is still running.
    pub fn try_wait(&mut self) -> Result<Option<Disposition>> {
        if self.reaped {
            return Err(MxpoolError::Worker("Process already reaped".into()));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                let disposition = analyze_wait_status(status);
                if disposition.is_some() {
                    self.reaped = true;
                }
                Ok(disposition)
            }
            Err(e) => Err(MxpoolError::Worker(format!("waitpid failed: {}", e))),
        }
    }

    /// Send SIGTERM to the process.
    pub fn terminate(&self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGTERM)
            .map_err(|e| MxpoolError::Worker(format!("Failed to send SIGTERM: {}", e)))
    }

    /// Send SIGKILL to the process and reap it.
    pub fn kill(&mut self) -> Result<Disposition> {
        if !self.reaped {
            signal::kill(self.pid, Signal::SIGKILL)
                .map_err(|e| MxpoolError::Worker(format!("Failed to send SIGKILL: {}", e)))?;
        }
        self.close_inbound();
        self.wait()
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if !self.reaped {
            self.close_inbound();
            let _ = self.terminate();
            std::thread::sleep(Duration::from_millis(10));

            if let Ok(Some(_)) = self.try_wait() {
                return;
            }

            if self.kill().is_err() {
                self.reaped = true;
            }
        }
    }
}
