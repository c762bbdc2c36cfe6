//! Worker subprocess main entry point.
//!
//! This module runs when `mxpool --internal-worker` is invoked. The worker
//! owns one row of the product for one weight matrix and answers every
//! inbound frame with that row, until its inbound channel closes.

use super::ipc::{FrameReader, FrameWriter, PipeFd};
use super::protocol::{ResultFrame, WorkItem, inbound_frame_len};
use crate::error::{MxpoolError, Result};
use crate::lifecycle::{LogSink, WorkerIdentity};
use crate::matrix::{Matrix, render_row};
use std::fs::File;
use std::io::{self, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;

/// Startup configuration declared on the worker's command line.
#[derive(Debug, Clone)]
pub struct WorkerStartup {
    pub index: usize,
    pub weights: PathBuf,
    pub row: usize,
    pub dim: usize,
    pub log_dir: PathBuf,
    pub inbound_fd: RawFd,
    pub outbound_fd: RawFd,
}

/// Duplicate `fd` so the original descriptor number can be rebound.
fn take_fd(fd: RawFd) -> Result<PipeFd> {
    // Safety: dup only reads the descriptor table; the copy is owned by us.
    let copy = unsafe { libc::dup(fd) };
    if copy < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(unsafe { PipeFd::from_raw(copy) })
}

/// Point stdout and stderr at the worker's sinks.
fn bind_stdio(out: &File, err: &File) -> Result<()> {
    for (file, target) in [(out, libc::STDOUT_FILENO), (err, libc::STDERR_FILENO)] {
        // Safety: both descriptors are valid for the duration of the call.
        if unsafe { libc::dup2(file.as_raw_fd(), target) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

fn load_weights(startup: &WorkerStartup) -> Result<Matrix> {
    if startup.row >= startup.dim {
        return Err(MxpoolError::Worker(format!(
            "row {} is outside a {}x{} matrix",
            startup.row, startup.dim, startup.dim
        )));
    }
    Matrix::load(&startup.weights, startup.dim)
}

/// Worker main loop.
///
/// Reads work items until EOF, answering each with this worker's row.
fn worker_loop(
    startup: &WorkerStartup,
    weights: &Matrix,
    reader: &mut FrameReader,
    writer: &mut FrameWriter,
    out: &mut File,
) -> Result<()> {
    let mut history: Vec<(u32, Vec<i32>)> = Vec::new();

    loop {
        let frame = match reader.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => return Err(MxpoolError::Protocol(e.to_string())),
        };
        let item = WorkItem::decode(startup.dim, frame)?;
        let values = item.matrix.row_product(weights, startup.row);

        // Logged before answering: the coordinator annotates the sink once
        // it has every answer.
        writeln!(
            out,
            "input {} row {}: {}",
            item.sequence,
            startup.row,
            render_row(&values)
        )?;

        let response = ResultFrame {
            origin: startup.index as i32,
            sequence: item.sequence,
            vector: values,
        };
        writer.write_frame(&response.encode())?;
        history.push((item.sequence, response.vector));
    }

    writeln!(
        out,
        "row {} history ({} inputs)",
        startup.row,
        history.len()
    )?;
    for (sequence, values) in &history {
        writeln!(out, "{}: {}", sequence, render_row(values))?;
    }
    out.flush()?;
    Ok(())
}

fn run(startup: &WorkerStartup) -> Result<()> {
    let identity = WorkerIdentity::Process(std::process::id() as i32);
    let parent = nix::unistd::getppid().as_raw() as u32;

    let mut sink = LogSink::create(&startup.log_dir, identity)?;
    let outbound = take_fd(startup.outbound_fd)?;
    // Safety: the inbound descriptor is handed to us by the parent and
    // nothing else in this process reads it.
    let inbound = unsafe { PipeFd::from_raw(startup.inbound_fd) };
    sink.start_record(startup.index + 1, parent)?;
    let (mut out, err) = sink.into_files();
    bind_stdio(&out, &err)?;

    let weights = load_weights(startup)?;

    let mut reader = FrameReader::new(inbound, inbound_frame_len(startup.dim));
    let mut writer = FrameWriter::new(outbound);
    worker_loop(startup, &weights, &mut reader, &mut writer, &mut out)
}

/// Run the worker subprocess main function.
///
/// Never returns: exits 0 after a clean end of input, 1 on any failure.
pub fn run_worker_main(startup: WorkerStartup) -> ! {
    // Ignore SIGPIPE - a vanished coordinator shows up as an io::Error
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    match run(&startup) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("Worker error: {}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::protocol::outbound_frame_len;
    use std::io::Read;
    use tempfile::tempdir;

    fn startup(dir: &std::path::Path, weights: PathBuf, row: usize) -> WorkerStartup {
        WorkerStartup {
            index: 4,
            weights,
            row,
            dim: 2,
            log_dir: dir.to_path_buf(),
            inbound_fd: 0,
            outbound_fd: 1,
        }
    }

    fn pipe() -> (PipeFd, PipeFd) {
        let (r, w) = nix::unistd::pipe().unwrap();
        (PipeFd::new(r), PipeFd::new(w))
    }

    #[test]
    fn test_load_weights_rejects_row_outside_matrix() {
        let dir = tempdir().unwrap();
        let weights = dir.path().join("W.txt");
        std::fs::write(&weights, "1 0\n0 1\n").unwrap();
        assert!(load_weights(&startup(dir.path(), weights.clone(), 1)).is_ok());
        assert!(load_weights(&startup(dir.path(), weights, 2)).is_err());
    }

    #[test]
    fn test_worker_loop_answers_each_frame_then_summarizes() {
        let dir = tempdir().unwrap();
        let config = startup(dir.path(), dir.path().join("unused"), 1);
        let weights = Matrix::from_rows(2, &[&[1, 2], &[3, 4]]);

        let (in_read, in_write) = pipe();
        let (out_read, out_write) = pipe();
        let mut feeder = FrameWriter::new(in_write);
        for sequence in 0..2 {
            let a = Matrix::from_rows(2, &[&[0, 0], &[1, sequence as i32]]);
            feeder
                .write_frame(&WorkItem::new(sequence, a, "").encode())
                .unwrap();
        }
        drop(feeder);

        let log_path = dir.path().join("worker.out");
        let mut log = File::create(&log_path).unwrap();
        let mut reader = FrameReader::new(in_read, inbound_frame_len(2));
        let mut writer = FrameWriter::new(out_write);
        worker_loop(&config, &weights, &mut reader, &mut writer, &mut log).unwrap();
        drop(writer);

        let mut results = FrameReader::new(out_read, outbound_frame_len(2));
        let first = ResultFrame::decode(2, results.read_frame().unwrap().unwrap()).unwrap();
        assert_eq!((first.origin, first.sequence), (4, 0));
        assert_eq!(first.vector, vec![1, 2]);
        let second = ResultFrame::decode(2, results.read_frame().unwrap().unwrap()).unwrap();
        assert_eq!(second.sequence, 1);
        assert_eq!(second.vector, vec![4, 6]);
        assert!(results.read_frame().unwrap().is_none());

        let mut text = String::new();
        File::open(&log_path)
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        assert!(text.contains("input 0 row 1: 1 2"));
        assert!(text.contains("row 1 history (2 inputs)"));
        assert!(text.ends_with("1: 4 6\n"));
    }

    #[test]
    fn test_worker_loop_rejects_truncated_frame() {
        let dir = tempdir().unwrap();
        let config = startup(dir.path(), dir.path().join("unused"), 0);
        let weights = Matrix::zeros(2);

        let (in_read, in_write) = pipe();
        let (_out_read, out_write) = pipe();
        let mut feeder = FrameWriter::new(in_write);
        feeder.write_frame(&[0, 0, 0]).unwrap();
        drop(feeder);

        let mut log = tempfile::tempfile().unwrap();
        let mut reader = FrameReader::new(in_read, inbound_frame_len(2));
        let mut writer = FrameWriter::new(out_write);
        let err = worker_loop(&config, &weights, &mut reader, &mut writer, &mut log).unwrap_err();
        assert!(matches!(err, MxpoolError::Protocol(_)));
    }

    #[test]
    fn test_row_is_logged_before_it_is_sent() {
        let dir = tempdir().unwrap();
        let config = startup(dir.path(), dir.path().join("unused"), 1);
        let weights = Matrix::from_rows(2, &[&[1, 2], &[3, 4]]);

        let (in_read, in_write) = pipe();
        let (out_read, out_write) = pipe();
        let mut feeder = FrameWriter::new(in_write);
        let a = Matrix::from_rows(2, &[&[0, 0], &[1, 1]]);
        feeder.write_frame(&WorkItem::new(0, a, "").encode()).unwrap();
        drop(feeder);
        // Nobody will read the answer
        drop(out_read);

        let log_path = dir.path().join("worker.out");
        let mut log = File::create(&log_path).unwrap();
        let mut reader = FrameReader::new(in_read, inbound_frame_len(2));
        let mut writer = FrameWriter::new(out_write);
        assert!(worker_loop(&config, &weights, &mut reader, &mut writer, &mut log).is_err());

        let text = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(text, "input 0 row 1: 4 6\n");
    }
}
