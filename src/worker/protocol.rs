//! Fixed-size wire frames between the coordinator and process workers.
//!
//! Frames carry no length header. Both sides derive the size from the
//! matrix dimension, which is passed to the worker on its command line.
//!
//! ```text
//! inbound   sequence:i32 | matrix:[N*N]i32           4 + 4N² bytes
//! outbound  origin:i32   | sequence:i32 | row:[N]i32  8 + 4N  bytes
//! ```
//!
//! All integers are little-endian.

use crate::error::{MxpoolError, Result};
use crate::matrix::Matrix;
use serde::Serialize;

/// Wire format version. Bump when either frame layout changes.
pub const WIRE_VERSION: u32 = 1;

/// Size in bytes of an inbound (work item) frame.
pub fn inbound_frame_len(dim: usize) -> usize {
    4 + 4 * dim * dim
}

/// Size in bytes of an outbound (partial result) frame.
pub fn outbound_frame_len(dim: usize) -> usize {
    8 + 4 * dim
}

/// One input matrix for one iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub sequence: u32,
    pub matrix: Matrix,
    /// Where the matrix came from. Only used for log metadata; not sent.
    pub source: String,
}

impl WorkItem {
    pub fn new(sequence: u32, matrix: Matrix, source: impl Into<String>) -> Self {
        Self {
            sequence,
            matrix,
            source: source.into(),
        }
    }

    /// Encode as an inbound frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(inbound_frame_len(self.matrix.dim()));
        buf.extend_from_slice(&(self.sequence as i32).to_le_bytes());
        for value in self.matrix.cells() {
            buf.extend_from_slice(&value.to_le_bytes());
        }
        buf
    }

    /// Decode an inbound frame for dimension `dim`.
    pub fn decode(dim: usize, frame: &[u8]) -> Result<Self> {
        check_len("inbound", frame, inbound_frame_len(dim))?;
        let mut words = read_words(frame);
        let sequence = words.next().unwrap_or_default() as u32;
        let matrix = Matrix::from_cells(dim, words.collect())?;
        Ok(Self {
            sequence,
            matrix,
            source: String::new(),
        })
    }
}

/// Which slice of the product a partial result covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Origin {
    /// A full output row, produced by a process worker.
    Row { weight: usize, row: usize },
    /// A single output cell, produced by a thread worker.
    Cell { weight: usize, row: usize, col: usize },
}

/// A worker's answer for one iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialResult {
    pub origin: Origin,
    pub sequence: u32,
    pub vector: Vec<i32>,
}

/// Raw outbound frame. `origin` is the sending worker's pool index; the pool
/// maps it back to an [`Origin`] using that worker's plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultFrame {
    pub origin: i32,
    pub sequence: u32,
    pub vector: Vec<i32>,
}

impl ResultFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(outbound_frame_len(self.vector.len()));
        buf.extend_from_slice(&self.origin.to_le_bytes());
        buf.extend_from_slice(&(self.sequence as i32).to_le_bytes());
        for value in &self.vector {
            buf.extend_from_slice(&value.to_le_bytes());
        }
        buf
    }

    pub fn decode(dim: usize, frame: &[u8]) -> Result<Self> {
        check_len("outbound", frame, outbound_frame_len(dim))?;
        let mut words = read_words(frame);
        let origin = words.next().unwrap_or_default();
        let sequence = words.next().unwrap_or_default() as u32;
        Ok(Self {
            origin,
            sequence,
            vector: words.collect(),
        })
    }
}

fn check_len(kind: &str, frame: &[u8], expected: usize) -> Result<()> {
    if frame.len() != expected {
        return Err(MxpoolError::Protocol(format!(
            "{} frame is {} bytes, expected {} (wire v{})",
            kind,
            frame.len(),
            expected,
            WIRE_VERSION
        )));
    }
    Ok(())
}

fn read_words(frame: &[u8]) -> impl Iterator<Item = i32> + '_ {
    frame
        .chunks_exact(4)
        .map(|chunk| i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
}
