//! In-process worker threads.
//!
//! A thread worker owns one output cell for one weight matrix. It receives
//! items over a channel, writes its cell into the shared accumulator
//! and acknowledges with a one-value [`PartialResult`].

use super::disposition::Disposition;
use super::protocol::{Origin, PartialResult, WorkItem};
use crate::accumulator::SharedAccumulator;
use crate::error::{MxpoolError, Result};
use crate::lifecycle::{LogSink, WorkerIdentity};
use crate::matrix::Matrix;
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Exit code reported for a worker thread that panicked.
pub const PANIC_EXIT_CODE: i32 = 101;

/// Startup configuration of one thread worker.
#[derive(Debug, Clone)]
pub struct ThreadConfig {
    pub index: usize,
    pub weight: usize,
    pub row: usize,
    pub col: usize,
    pub dim: usize,
    pub log_dir: PathBuf,
    /// Preloaded weight matrix, or the reason it could not be loaded.
    pub weights: std::result::Result<Arc<Matrix>, String>,
}

/// Handle to a running worker thread.
pub struct ThreadUnit {
    identity: WorkerIdentity,
    inbound: Option<Sender<Arc<WorkItem>>>,
    outbound: Receiver<PartialResult>,
    handle: Option<JoinHandle<i32>>,
}

impl ThreadUnit {
    pub fn identity(&self) -> WorkerIdentity {
        self.identity
    }

    pub fn is_inbound_open(&self) -> bool {
        self.inbound.is_some()
    }

    /// Queue an item. Fails if the thread already stopped receiving.
    pub fn send(&mut self, item: Arc<WorkItem>) -> Result<()> {
        let sender = self
            .inbound
            .as_ref()
            .ok_or_else(|| MxpoolError::Worker("inbound channel already closed".into()))?;
        sender
            .send(item)
            .map_err(|_| MxpoolError::Worker(format!("worker {} stopped receiving", self.identity)))
    }

    /// Block for the next acknowledgement. `None` once the thread has ended.
    pub fn recv(&mut self) -> Option<PartialResult> {
        self.outbound.recv().ok()
    }

    pub fn close_inbound(&mut self) {
        self.inbound.take();
    }

    /// Wait for the thread to finish and report how it ended.
    pub fn join(&mut self) -> Disposition {
        self.close_inbound();
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(code) => Disposition::Exited(code),
                Err(_) => Disposition::Exited(PANIC_EXIT_CODE),
            },
            None => Disposition::Exited(0),
        }
    }
}

/// Start a worker thread.
pub fn spawn_thread_worker(config: ThreadConfig, shared: SharedAccumulator) -> Result<ThreadUnit> {
    let identity = WorkerIdentity::Thread {
        parent: std::process::id(),
        index: config.index,
    };
    let (inbound_tx, inbound_rx) = unbounded::<Arc<WorkItem>>();
    let (outbound_tx, outbound_rx) = unbounded::<PartialResult>();
    let index = config.index;

    let handle = std::thread::Builder::new()
        .name(format!("mxpool-w{}", index))
        .spawn(move || thread_main(identity, config, shared, inbound_rx, outbound_tx))
        .map_err(|e| MxpoolError::SpawnFailure {
            index,
            reason: e.to_string(),
        })?;

    Ok(ThreadUnit {
        identity,
        inbound: Some(inbound_tx),
        outbound: outbound_rx,
        handle: Some(handle),
    })
}

fn thread_main(
    identity: WorkerIdentity,
    config: ThreadConfig,
    shared: SharedAccumulator,
    inbound: Receiver<Arc<WorkItem>>,
    outbound: Sender<PartialResult>,
) -> i32 {
    let mut sink = match LogSink::create(&config.log_dir, identity) {
        Ok(sink) => sink,
        Err(e) => {
            tracing::warn!(worker_id = %identity, error = %e, "Worker could not create its log sink");
            return 1;
        }
    };

    match serve(&config, &shared, &inbound, &outbound, &mut sink) {
        Ok(()) => 0,
        Err(e) => {
            let _ = writeln!(sink.err(), "{}", e);
            1
        }
    }
}

fn serve(
    config: &ThreadConfig,
    shared: &SharedAccumulator,
    inbound: &Receiver<Arc<WorkItem>>,
    outbound: &Sender<PartialResult>,
    sink: &mut LogSink,
) -> Result<()> {
    sink.start_record(config.index + 1, std::process::id())?;

    let weights = config.weights.clone().map_err(MxpoolError::Worker)?;
    if config.row >= config.dim || config.col >= config.dim {
        return Err(MxpoolError::Worker(format!(
            "cell ({}, {}) is outside a {}x{} matrix",
            config.row, config.col, config.dim, config.dim
        )));
    }

    let origin = Origin::Cell {
        weight: config.weight,
        row: config.row,
        col: config.col,
    };
    let mut history: Vec<(u32, i32)> = Vec::new();

    // Disconnect means the pool closed our inbound channel
    while let Ok(item) = inbound.recv() {
        let value = item.matrix.cell_product(&weights, config.row, config.col);
        shared.merge_cell(item.sequence, config.weight, config.row, config.col, value)?;

        // The coordinator may have stopped listening; the merge already landed
        let _ = outbound.send(PartialResult {
            origin,
            sequence: item.sequence,
            vector: vec![value],
        });

        writeln!(
            sink.out(),
            "input {} cell ({}, {}): {}",
            item.sequence, config.row, config.col, value
        )?;
        history.push((item.sequence, value));
    }

    writeln!(
        sink.out(),
        "cell ({}, {}) history ({} inputs)",
        config.row,
        config.col,
        history.len()
    )?;
    for (sequence, value) in &history {
        writeln!(sink.out(), "{}: {}", sequence, value)?;
    }
    sink.out().flush()?;
    Ok(())
}
