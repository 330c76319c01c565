//! Row-range partitioning of a matrix across workers.
//!
//! Rows are split into contiguous ranges of `n / w` rows each, with the last
//! range taking whatever is left over. This is the established chunking
//! policy even though it is uneven when `n` is not a multiple of `w`.

use crate::error::ConfigError;

/// A half-open row range `[start_row, end_row)` assigned to one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkAssignment {
    pub start_row: usize,
    pub end_row: usize,
}

impl ChunkAssignment {
    pub fn len(&self) -> usize {
        self.end_row - self.start_row
    }

    pub fn is_empty(&self) -> bool {
        self.start_row == self.end_row
    }
}

/// Plan the row ranges for an `n`-row matrix and `workers` requested workers.
///
/// The effective worker count is `min(workers, n)`, so no range is ever
/// empty. Fails if `workers` is zero or negative.
pub fn plan(n: usize, workers: i64) -> Result<Vec<ChunkAssignment>, ConfigError> {
    if workers <= 0 {
        return Err(ConfigError::InvalidWorkerCount(workers));
    }

    let workers = usize::try_from(workers).unwrap_or(usize::MAX).min(n);
    if workers == 0 {
        return Ok(Vec::new());
    }

    let base = n / workers;
    let mut assignments = Vec::with_capacity(workers);
    let mut start_row = 0;
    for i in 0..workers {
        let end_row = if i + 1 == workers { n } else { start_row + base };
        assignments.push(ChunkAssignment { start_row, end_row });
        start_row = end_row;
    }

    Ok(assignments)
}
