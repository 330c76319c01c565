//! Parallel element-wise matrix addition.
//!
//! The result buffer is split into one disjoint mutable slice per chunk
//! before any worker starts, so each output row has exactly one writer and
//! the hot loop needs no locking. Workers are scoped threads: `add` cannot
//! return before every one of them has been joined.
//!
//! Workers check a shared cancel flag between rows, so an abandoned
//! computation releases its threads soon after the flag is raised.

use crate::error::ComputeError;
use crate::matrix::Matrix;
use crate::planner::ChunkAssignment;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::trace;

/// Add `a` and `b`, one worker thread per chunk of `plan`.
///
/// Returns the full sum or an error; a partially written result is never
/// handed back.
pub fn add(a: &Matrix, b: &Matrix, plan: &[ChunkAssignment]) -> Result<Matrix, ComputeError> {
    add_cancellable(a, b, plan, &AtomicBool::new(false))
}

/// Like [`add`], but gives up with `ComputeError::Aborted` once `cancel` is set.
pub fn add_cancellable(
    a: &Matrix,
    b: &Matrix,
    plan: &[ChunkAssignment],
    cancel: &AtomicBool,
) -> Result<Matrix, ComputeError> {
    if a.dim() != b.dim() {
        return Err(ComputeError::ShapeMismatch {
            left: a.dim(),
            right: b.dim(),
        });
    }
    let n = a.dim();
    check_plan(n, plan)?;

    let mut result = Matrix::zeros(n);
    let mut rest = result.as_mut_slice();
    let mut parts = Vec::with_capacity(plan.len());
    for chunk in plan {
        let (head, tail) = std::mem::take(&mut rest).split_at_mut(chunk.len() * n);
        parts.push((*chunk, head));
        rest = tail;
    }

    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(parts.len());
        let mut failure = None;

        for (worker, (chunk, out)) in parts.into_iter().enumerate() {
            let spawned = thread::Builder::new()
                .name(format!("adder-{worker}"))
                .spawn_scoped(scope, move || add_chunk(a, b, chunk, out, cancel));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    failure = Some(ComputeError::Spawn(e.to_string()));
                    break;
                }
            }
        }

        for handle in handles {
            let outcome = match handle.join() {
                Ok(outcome) => outcome,
                Err(_) => Err(ComputeError::WorkerPanicked),
            };
            if let Err(e) = outcome {
                if failure.is_none() {
                    failure = Some(e);
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    })?;

    Ok(result)
}

/// Sum the rows of one chunk into `out`, which holds exactly those rows.
fn add_chunk(
    a: &Matrix,
    b: &Matrix,
    chunk: ChunkAssignment,
    out: &mut [i64],
    cancel: &AtomicBool,
) -> Result<(), ComputeError> {
    let n = a.dim();
    let start = chunk.start_row * n;
    let end = start + out.len();
    let lhs = &a.as_slice()[start..end];
    let rhs = &b.as_slice()[start..end];

    let rows = out.chunks_mut(n).zip(lhs.chunks(n)).zip(rhs.chunks(n));
    for (offset, ((dst, x), y)) in rows.enumerate() {
        if cancel.load(Ordering::Relaxed) {
            return Err(ComputeError::Aborted);
        }
        let row = chunk.start_row + offset;
        for (col, ((dst, x), y)) in dst.iter_mut().zip(x).zip(y).enumerate() {
            *dst = x.checked_add(*y).ok_or(ComputeError::Overflow { row, col })?;
        }
    }

    trace!(start_row = chunk.start_row, end_row = chunk.end_row, "Chunk done");
    Ok(())
}

/// The plan must tile `[0, n)` in order with no gaps.
fn check_plan(n: usize, plan: &[ChunkAssignment]) -> Result<(), ComputeError> {
    let mut next = 0;
    for chunk in plan {
        if chunk.start_row != next || chunk.end_row < chunk.start_row {
            return Err(ComputeError::PlanMismatch { rows: n });
        }
        next = chunk.end_row;
    }
    if next != n {
        return Err(ComputeError::PlanMismatch { rows: n });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::plan;

    fn matrix(dim: usize, f: impl Fn(usize, usize) -> i64) -> Matrix {
        Matrix::from_fn(dim, f)
    }

    #[test]
    fn test_add_matches_sequential_for_any_worker_count() {
        for n in [1, 2, 5, 16, 33] {
            let a = matrix(n, |r, c| (r * 31 + c * 7) as i64 - 50);
            let b = matrix(n, |r, c| (r as i64 - c as i64) * 3);
            let expected = a.checked_add(&b).unwrap();
            for w in 1..=n as i64 + 2 {
                let chunks = plan(n, w).unwrap();
                assert_eq!(add(&a, &b, &chunks).unwrap(), expected, "n={n} w={w}");
            }
        }
    }

    #[test]
    fn test_add_overflow_reports_position() {
        let a = matrix(3, |_, _| 1);
        let b = matrix(3, |r, c| if (r, c) == (2, 1) { i64::MAX } else { 0 });
        let chunks = plan(3, 3).unwrap();
        assert_eq!(
            add(&a, &b, &chunks),
            Err(ComputeError::Overflow { row: 2, col: 1 })
        );
    }

    #[test]
    fn test_add_stops_when_cancelled() {
        let a = matrix(8, |r, c| (r + c) as i64);
        let cancel = AtomicBool::new(true);
        assert_eq!(
            add_cancellable(&a, &a, &plan(8, 4).unwrap(), &cancel),
            Err(ComputeError::Aborted)
        );

        let cancel = AtomicBool::new(false);
        assert_eq!(
            add_cancellable(&a, &a, &plan(8, 4).unwrap(), &cancel),
            Ok(a.checked_add(&a).unwrap())
        );
    }

    #[test]
    fn test_add_shape_mismatch() {
        let a = matrix(2, |_, _| 0);
        let b = matrix(3, |_, _| 0);
        assert_eq!(
            add(&a, &b, &plan(2, 1).unwrap()),
            Err(ComputeError::ShapeMismatch { left: 2, right: 3 })
        );
    }

    #[test]
    fn test_add_rejects_bad_plan() {
        let a = matrix(4, |_, _| 1);
        let gap = [
            ChunkAssignment { start_row: 0, end_row: 1 },
            ChunkAssignment { start_row: 2, end_row: 4 },
        ];
        assert_eq!(add(&a, &a, &gap), Err(ComputeError::PlanMismatch { rows: 4 }));

        let short = [ChunkAssignment { start_row: 0, end_row: 3 }];
        assert_eq!(add(&a, &a, &short), Err(ComputeError::PlanMismatch { rows: 4 }));
    }
}
