//! Square integer matrix stored row-major in a single buffer.

use std::fmt;

/// A square `n x n` matrix of signed integers.
///
/// Rows are stored contiguously so a row range maps to one slice of the
/// backing buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matrix {
    dim: usize,
    data: Vec<i64>,
}

impl Matrix {
    /// Create an all-zero matrix.
    pub fn zeros(dim: usize) -> Self {
        Self {
            dim,
            data: vec![0; dim * dim],
        }
    }

    /// Build a matrix by evaluating `f(row, col)` for every element.
    pub fn from_fn(dim: usize, mut f: impl FnMut(usize, usize) -> i64) -> Self {
        let data = (0..dim * dim).map(|i| f(i / dim, i % dim)).collect();
        Self { dim, data }
    }

    /// Build a matrix from a row-major buffer.
    ///
    /// Returns `None` if the buffer length is not `dim * dim`.
    pub fn from_row_major(dim: usize, data: Vec<i64>) -> Option<Self> {
        if dim.checked_mul(dim)? != data.len() {
            return None;
        }
        Some(Self { dim, data })
    }

    /// Build a matrix from nested rows.
    ///
    /// Returns `None` unless there are `n` rows of exactly `n` values each.
    pub fn from_rows(rows: Vec<Vec<i64>>) -> Option<Self> {
        let dim = rows.len();
        if rows.iter().any(|row| row.len() != dim) {
            return None;
        }
        Some(Self {
            dim,
            data: rows.into_iter().flatten().collect(),
        })
    }

    /// Number of rows (and columns).
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn row(&self, index: usize) -> &[i64] {
        &self.data[index * self.dim..(index + 1) * self.dim]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[i64]> {
        // chunks(0) panics, an empty matrix has no rows anyway
        self.data.chunks(self.dim.max(1))
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.data
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [i64] {
        &mut self.data
    }

    /// Sequential element-wise sum, `None` on overflow or shape mismatch.
    pub fn checked_add(&self, other: &Matrix) -> Option<Matrix> {
        if self.dim != other.dim {
            return None;
        }
        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| a.checked_add(*b))
            .collect::<Option<Vec<_>>>()?;
        Some(Matrix {
            dim: self.dim,
            data,
        })
    }
}

impl fmt::Display for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in self.rows() {
            let mut first = true;
            for value in row {
                if !first {
                    write!(f, "\t")?;
                }
                write!(f, "{value}")?;
                first = false;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
