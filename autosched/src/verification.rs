//! Checks that a tuned schedule still computes what its definition says.

use crate::lower::{lower, LowerError};
use crate::runtime::{Module, RuntimeError};
use crate::schedule::Schedule;
use crate::tensor::Tensor;

use ndarray::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

const RTOL: f32 = 1e-3;
const ATOL: f32 = 1e-4;
const DATA_SEED: u64 = 0x5eed;

#[derive(thiserror::Error, Debug)]
pub enum VerificationError {
    #[error(transparent)]
    Lower(#[from] LowerError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("Expected buffers [A, B, C] of a batched matmul, got shapes {0:?}")]
    NotABatchMatmul(Vec<Vec<u32>>),
    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Runs `schedule` on random data and compares its output buffer against
/// `C[b] = A[b] · B[b]` computed by ndarray.
pub fn check_batch_matmul(schedule: &Schedule, bufs: &[Tensor]) -> Result<bool, VerificationError> {
    let shapes = bufs.iter().map(|t| t.shape().to_vec()).collect::<Vec<_>>();
    let dims = match shapes.as_slice() {
        [a, b, c]
            if a.len() == 3
                && b.len() == 3
                && c.len() == 3
                && a[0] == b[0]
                && a[0] == c[0]
                && a[2] == b[1]
                && a[1] == c[1]
                && b[2] == c[2] =>
        {
            (a[0] as usize, a[1] as usize, a[2] as usize, b[2] as usize)
        }
        _ => return Err(VerificationError::NotABatchMatmul(shapes)),
    };
    let (batch, n, l, m) = dims;

    let module = Module::new(lower(schedule, bufs, "check")?);
    let mut data = module.random_args(&mut StdRng::seed_from_u64(DATA_SEED));
    module.run(&mut data)?;

    let lhs = ArrayView3::from_shape((batch, n, l), &data[0])?;
    let rhs = ArrayView3::from_shape((batch, l, m), &data[1])?;
    let out = ArrayView3::from_shape((batch, n, m), &data[2])?;
    let passed = (0..batch).all(|b| {
        let expected = lhs.index_axis(Axis(0), b).dot(&rhs.index_axis(Axis(0), b));
        all_close(out.index_axis(Axis(0), b).iter(), expected.iter())
    });
    log_outcome(passed);
    Ok(passed)
}

/// Runs `schedule` and the default schedule of the same computation on the
/// same random data and compares every buffer.
pub fn check_against_default(
    schedule: &Schedule,
    bufs: &[Tensor],
) -> Result<bool, VerificationError> {
    let ops = schedule
        .stages()
        .iter()
        .map(|s| s.op().clone())
        .collect::<Vec<_>>();
    let module = Module::new(lower(schedule, bufs, "check")?);
    let reference = Module::new(lower(&Schedule::create(&ops), bufs, "reference")?);

    let mut data = module.random_args(&mut StdRng::seed_from_u64(DATA_SEED));
    let mut expected = data.clone();
    module.run(&mut data)?;
    reference.run(&mut expected)?;

    let passed = data
        .iter()
        .zip(&expected)
        .all(|(a, e)| all_close(a.iter(), e.iter()));
    log_outcome(passed);
    Ok(passed)
}

fn all_close<'a>(
    actual: impl Iterator<Item = &'a f32>,
    expected: impl Iterator<Item = &'a f32>,
) -> bool {
    actual
        .zip(expected)
        .all(|(a, e)| (a - e).abs() <= ATOL + RTOL * e.abs())
}

fn log_outcome(passed: bool) {
    if passed {
        log::debug!("Schedule passed correctness check");
    } else {
        log::debug!("Schedule failed correctness check");
    }
}
