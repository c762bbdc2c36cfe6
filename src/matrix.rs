//! Fixed-dimension integer matrices.
//!
//! Every matrix in a run has the same dimension N. Text input is read one
//! row per line with whitespace-separated integers; short input is
//! zero-padded and anything beyond N rows or N columns is ignored.

use crate::error::{MxpoolError, Result};
use serde::{Serialize, Serializer};
use std::fmt::Write as _;
use std::path::Path;

/// Default matrix dimension.
pub const DEFAULT_DIM: usize = 8;

/// An N×N grid of `i32`, stored row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matrix {
    dim: usize,
    cells: Vec<i32>,
}

impl Matrix {
    /// Create a zero-filled matrix.
    pub fn zeros(dim: usize) -> Self {
        Self {
            dim,
            cells: vec![0; dim * dim],
        }
    }

    /// Build a matrix from row slices, zero-padding and truncating to `dim`.
    pub fn from_rows(dim: usize, rows: &[&[i32]]) -> Self {
        let mut matrix = Self::zeros(dim);
        for (r, row) in rows.iter().take(dim).enumerate() {
            for (c, value) in row.iter().take(dim).enumerate() {
                matrix.set(r, c, *value);
            }
        }
        matrix
    }

    /// Build a matrix from a row-major cell buffer of exactly `dim * dim` values.
    pub fn from_cells(dim: usize, cells: Vec<i32>) -> Result<Self> {
        if cells.len() != dim * dim {
            return Err(MxpoolError::Protocol(format!(
                "expected {} cells for a {}x{} matrix, got {}",
                dim * dim,
                dim,
                dim,
                cells.len()
            )));
        }
        Ok(Self { dim, cells })
    }

    /// Parse matrix text. `path` is only used for error messages.
    pub fn parse(text: &str, dim: usize, path: &Path) -> Result<Self> {
        let mut matrix = Self::zeros(dim);
        for (r, line) in text.lines().take(dim).enumerate() {
            for (c, token) in line.split_whitespace().take(dim).enumerate() {
                let value = token
                    .parse::<i32>()
                    .map_err(|_| MxpoolError::InvalidMatrix {
                        path: path.to_path_buf(),
                        line: r + 1,
                        token: token.to_string(),
                    })?;
                matrix.set(r, c, value);
            }
        }
        Ok(matrix)
    }

    /// Load a matrix file.
    pub fn load(path: &Path, dim: usize) -> Result<Self> {
        let text =
            std::fs::read_to_string(path).map_err(|e| MxpoolError::file_open(path, e))?;
        Self::parse(&text, dim, path)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn get(&self, row: usize, col: usize) -> i32 {
        self.cells[row * self.dim + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: i32) {
        self.cells[row * self.dim + col] = value;
    }

    pub fn row(&self, row: usize) -> &[i32] {
        &self.cells[row * self.dim..(row + 1) * self.dim]
    }

    /// Overwrite one row. `values` must have exactly `dim` entries.
    pub fn set_row(&mut self, row: usize, values: &[i32]) {
        self.cells[row * self.dim..(row + 1) * self.dim].copy_from_slice(values);
    }

    /// Row-major view of every cell.
    pub fn cells(&self) -> &[i32] {
        &self.cells
    }

    /// Rows as owned vectors, for reports.
    pub fn to_rows(&self) -> Vec<Vec<i32>> {
        self.cells.chunks(self.dim).map(<[i32]>::to_vec).collect()
    }

    /// One output row of `self × weights`: `out[k] = Σ_j self[row][j] · weights[j][k]`.
    ///
    /// Arithmetic wraps on overflow.
    pub fn row_product(&self, weights: &Matrix, row: usize) -> Vec<i32> {
        (0..self.dim)
            .map(|col| self.cell_product(weights, row, col))
            .collect()
    }

    /// One output cell of `self × weights`.
    pub fn cell_product(&self, weights: &Matrix, row: usize, col: usize) -> i32 {
        (0..self.dim).fold(0i32, |acc, k| {
            acc.wrapping_add(self.get(row, k).wrapping_mul(weights.get(k, col)))
        })
    }

    /// Full product, computed serially.
    pub fn product(&self, weights: &Matrix) -> Matrix {
        let mut out = Matrix::zeros(self.dim);
        for row in 0..self.dim {
            out.set_row(row, &self.row_product(weights, row));
        }
        out
    }

    /// Cell-wise wrapping addition of `other` into `self`.
    pub fn add_assign(&mut self, other: &Matrix) {
        for (cell, value) in self.cells.iter_mut().zip(other.cells.iter()) {
            *cell = cell.wrapping_add(*value);
        }
    }

    /// Render as `name=[` / one space-separated row per line / `]`.
    pub fn render(&self, name: &str) -> String {
        let mut out = format!("{}=[\n", name);
        for row in self.cells.chunks(self.dim) {
            let _ = writeln!(out, "{}", render_row(row));
        }
        out.push(']');
        out
    }
}

impl Serialize for Matrix {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(self.cells.chunks(self.dim))
    }
}

/// Space-separated values of one row.
pub fn render_row(row: &[i32]) -> String {
    row.iter()
        .map(i32::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}
