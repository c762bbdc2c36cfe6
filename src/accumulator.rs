//! Merging partial results into the run's result state.
//!
//! The accumulator is the single owner of result state. Process workers
//! never see it; their rows arrive over pipes and the coordinator merges
//! them. Thread workers write cells directly through a
//! [`SharedAccumulator`], which serializes every operation behind one mutex.

use crate::error::{MxpoolError, Result};
use crate::matrix::Matrix;
use crate::worker::{Origin, PartialResult};
use clap::ValueEnum;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};

/// How partial results combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MergePolicy {
    /// Each origin row overwrites its slot. Single weight matrix only.
    Place,
    /// Contributions from every weight matrix are summed cell by cell.
    Sum,
    /// One block per (iteration, weight), kept in iteration order.
    #[default]
    History,
}

/// A result matrix with per-cell "written" markers.
#[derive(Debug, Clone)]
struct Tracked {
    matrix: Matrix,
    written: Vec<bool>,
}

impl Tracked {
    fn new(dim: usize) -> Self {
        Self {
            matrix: Matrix::zeros(dim),
            written: vec![false; dim * dim],
        }
    }

    /// Store one cell. With `additive`, a cell that already has a baseline
    /// is added to instead of overwritten.
    fn put(&mut self, row: usize, col: usize, value: i32, additive: bool) {
        let idx = row * self.matrix.dim() + col;
        let current = self.matrix.get(row, col);
        let next = if additive && self.written[idx] {
            current.wrapping_add(value)
        } else {
            value
        };
        self.matrix.set(row, col, next);
        self.written[idx] = true;
    }

    fn put_row(&mut self, row: usize, values: &[i32], additive: bool) {
        for (col, value) in values.iter().enumerate() {
            self.put(row, col, *value, additive);
        }
    }

    fn clear_marks(&mut self) {
        self.written.fill(false);
    }

    fn unset_rows(&self) -> Vec<usize> {
        let dim = self.matrix.dim();
        (0..dim)
            .filter(|row| self.written[row * dim..(row + 1) * dim].contains(&false))
            .collect()
    }
}

/// One `(sequence, weight)` entry of the history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryBlock {
    pub sequence: u32,
    pub weight: usize,
    pub matrix: Matrix,
}

#[derive(Debug, Clone)]
struct Block {
    sequence: u32,
    weight: usize,
    cells: Tracked,
}

/// A row no worker delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnsetRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<usize>,
    pub row: usize,
}

#[derive(Debug, Clone)]
enum State {
    Place(Tracked),
    Sum(Tracked),
    History(Vec<Block>),
}

/// Final result state after [`Accumulator::finish`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "policy", content = "result", rename_all = "lowercase")]
pub enum FinalState {
    Place(Matrix),
    Sum(Matrix),
    History(Vec<HistoryBlock>),
}

/// Everything the accumulator knows at the end of a run.
#[derive(Debug, Clone)]
pub struct Finalized {
    pub state: FinalState,
    pub unset_rows: Vec<UnsetRow>,
    pub iterations: u32,
}

/// Result state under one merge policy.
#[derive(Debug, Clone)]
pub struct Accumulator {
    policy: MergePolicy,
    dim: usize,
    weights: usize,
    current: Option<u32>,
    state: State,
}

impl Accumulator {
    /// Create an empty accumulator for `weights` weight matrices of dimension `dim`.
    pub fn new(policy: MergePolicy, dim: usize, weights: usize) -> Result<Self> {
        if policy == MergePolicy::Place && weights > 1 {
            return Err(MxpoolError::Argument(format!(
                "place policy takes exactly one weight matrix, got {}",
                weights
            )));
        }
        let state = match policy {
            MergePolicy::Place => State::Place(Tracked::new(dim)),
            MergePolicy::Sum => State::Sum(Tracked::new(dim)),
            MergePolicy::History => State::History(Vec::new()),
        };
        Ok(Self {
            policy,
            dim,
            weights,
            current: None,
            state,
        })
    }

    /// Sequence number of the iteration currently accepting merges.
    pub fn current_sequence(&self) -> Option<u32> {
        self.current
    }

    /// Open iteration `sequence`. Sequences start at 0 and must be consecutive.
    ///
    /// History grows by one zeroed block per weight matrix; summation
    /// baselines are cleared so the first contributor of the new iteration
    /// sets each cell.
    pub fn begin_iteration(&mut self, sequence: u32) -> Result<()> {
        let expected = self.current.map_or(0, |s| s + 1);
        if sequence != expected {
            return Err(MxpoolError::Merge(format!(
                "iteration {} started out of order (expected {})",
                sequence, expected
            )));
        }
        match &mut self.state {
            State::Place(_) => {}
            State::Sum(tracked) => tracked.clear_marks(),
            State::History(blocks) => {
                for weight in 0..self.weights {
                    blocks.push(Block {
                        sequence,
                        weight,
                        cells: Tracked::new(self.dim),
                    });
                }
            }
        }
        self.current = Some(sequence);
        Ok(())
    }

    /// Merge a partial result under the configured policy.
    pub fn merge(&mut self, partial: &PartialResult) -> Result<()> {
        match partial.origin {
            Origin::Row { weight, row } => {
                if partial.vector.len() != self.dim {
                    return Err(MxpoolError::Merge(format!(
                        "row vector has {} values, expected {}",
                        partial.vector.len(),
                        self.dim
                    )));
                }
                self.check(partial.sequence, weight, row, 0)?;
                let additive = self.policy == MergePolicy::Sum;
                self.target(partial.sequence, weight)?
                    .put_row(row, &partial.vector, additive);
                Ok(())
            }
            Origin::Cell { weight, row, col } => match partial.vector.as_slice() {
                [value] => self.merge_cell(partial.sequence, weight, row, col, *value),
                other => Err(MxpoolError::Merge(format!(
                    "cell result has {} values, expected 1",
                    other.len()
                ))),
            },
        }
    }

    /// Merge a single cell.
    pub fn merge_cell(
        &mut self,
        sequence: u32,
        weight: usize,
        row: usize,
        col: usize,
        value: i32,
    ) -> Result<()> {
        self.check(sequence, weight, row, col)?;
        let additive = self.policy == MergePolicy::Sum;
        self.target(sequence, weight)?.put(row, col, value, additive);
        Ok(())
    }

    fn check(&self, sequence: u32, weight: usize, row: usize, col: usize) -> Result<()> {
        if self.current != Some(sequence) {
            return Err(MxpoolError::Merge(format!(
                "partial for iteration {} arrived while iteration {:?} is open",
                sequence, self.current
            )));
        }
        if weight >= self.weights {
            return Err(MxpoolError::Merge(format!(
                "weight index {} out of range ({} weights)",
                weight, self.weights
            )));
        }
        if row >= self.dim || col >= self.dim {
            return Err(MxpoolError::Merge(format!(
                "cell ({}, {}) out of range for dimension {}",
                row, col, self.dim
            )));
        }
        Ok(())
    }

    fn target(&mut self, sequence: u32, weight: usize) -> Result<&mut Tracked> {
        match &mut self.state {
            State::Place(tracked) | State::Sum(tracked) => Ok(tracked),
            State::History(blocks) => blocks
                .iter_mut()
                .rev()
                .find(|block| block.sequence == sequence && block.weight == weight)
                .map(|block| &mut block.cells)
                .ok_or_else(|| {
                    MxpoolError::Merge(format!(
                        "no history block for iteration {} weight {}",
                        sequence, weight
                    ))
                }),
        }
    }

    /// Rows that have not been delivered.
    pub fn unset_rows(&self) -> Vec<UnsetRow> {
        match &self.state {
            State::Place(tracked) => tracked
                .unset_rows()
                .into_iter()
                .map(|row| UnsetRow {
                    sequence: None,
                    weight: None,
                    row,
                })
                .collect(),
            State::Sum(tracked) => tracked
                .unset_rows()
                .into_iter()
                .map(|row| UnsetRow {
                    sequence: self.current,
                    weight: None,
                    row,
                })
                .collect(),
            State::History(blocks) => blocks
                .iter()
                .flat_map(|block| {
                    block.cells.unset_rows().into_iter().map(|row| UnsetRow {
                        sequence: Some(block.sequence),
                        weight: Some(block.weight),
                        row,
                    })
                })
                .collect(),
        }
    }

    /// Close the run, applying `bias` once to every output matrix.
    pub fn finish(self, bias: Option<&Matrix>) -> Finalized {
        let unset_rows = self.unset_rows();
        let iterations = self.current.map_or(0, |s| s + 1);
        let add_bias = |mut matrix: Matrix| {
            if let Some(bias) = bias {
                matrix.add_assign(bias);
            }
            matrix
        };
        let state = match self.state {
            State::Place(tracked) => FinalState::Place(add_bias(tracked.matrix)),
            State::Sum(tracked) => FinalState::Sum(add_bias(tracked.matrix)),
            State::History(blocks) => FinalState::History(
                blocks
                    .into_iter()
                    .map(|block| HistoryBlock {
                        sequence: block.sequence,
                        weight: block.weight,
                        matrix: add_bias(block.cells.matrix),
                    })
                    .collect(),
            ),
        };
        Finalized {
            state,
            unset_rows,
            iterations,
        }
    }
}

/// Accumulator handle shared between the coordinator and thread workers.
#[derive(Debug, Clone)]
pub struct SharedAccumulator {
    inner: Arc<Mutex<Accumulator>>,
}

impl SharedAccumulator {
    pub fn new(accumulator: Accumulator) -> Self {
        Self {
            inner: Arc::new(Mutex::new(accumulator)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Accumulator>> {
        self.inner
            .lock()
            .map_err(|_| MxpoolError::Merge("accumulator mutex poisoned".into()))
    }

    pub fn begin_iteration(&self, sequence: u32) -> Result<()> {
        self.lock()?.begin_iteration(sequence)
    }

    pub fn merge(&self, partial: &PartialResult) -> Result<()> {
        self.lock()?.merge(partial)
    }

    pub fn merge_cell(
        &self,
        sequence: u32,
        weight: usize,
        row: usize,
        col: usize,
        value: i32,
    ) -> Result<()> {
        self.lock()?.merge_cell(sequence, weight, row, col, value)
    }

    /// Finish the run. Must be called after every worker handle is dropped.
    pub fn finish(self, bias: Option<&Matrix>) -> Result<Finalized> {
        let mutex = Arc::try_unwrap(self.inner).map_err(|_| {
            MxpoolError::Merge("accumulator still shared by running workers".into())
        })?;
        let accumulator = mutex
            .into_inner()
            .map_err(|_| MxpoolError::Merge("accumulator mutex poisoned".into()))?;
        Ok(accumulator.finish(bias))
    }
}
