use crate::lower::{Access, LoweredExpr, LoweredFunc, LoweredStage};

use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A built, runnable [LoweredFunc].
///
/// Execution interprets the loop nests directly. Vectorized loops run as plain
/// inner loops; the annotation only affects loop structure.
#[derive(Debug, Clone)]
pub struct Module {
    func: Arc<LoweredFunc>,
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum RuntimeError {
    #[error("Expected {expected} buffers, got {got}")]
    BufferCount { expected: usize, got: usize },
    #[error("Buffer {name} should hold {expected} elements, but holds {got}")]
    BufferSize {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("Run was cancelled")]
    Cancelled,
}

impl Module {
    pub fn new(func: LoweredFunc) -> Self {
        Module {
            func: Arc::new(func),
        }
    }

    pub fn func(&self) -> &LoweredFunc {
        &self.func
    }

    /// Allocates argument buffers, filling every buffer with uniform random
    /// values in `[0, 1)`.
    pub fn random_args<R: Rng>(&self, rng: &mut R) -> Vec<Vec<f32>> {
        self.func
            .args
            .iter()
            .map(|t| (0..t.volume()).map(|_| rng.gen::<f32>()).collect())
            .collect()
    }

    pub fn run(&self, args: &mut [Vec<f32>]) -> Result<(), RuntimeError> {
        self.run_cancellable(args, &AtomicBool::new(false))
    }

    /// Like [Module::run], but stops with [RuntimeError::Cancelled] soon after
    /// `cancel` is set. The flag is polled once per iteration of every loop
    /// except the innermost. Buffers are left partially written.
    pub fn run_cancellable(
        &self,
        args: &mut [Vec<f32>],
        cancel: &AtomicBool,
    ) -> Result<(), RuntimeError> {
        let func = &self.func;
        if args.len() != func.args.len() {
            return Err(RuntimeError::BufferCount {
                expected: func.args.len(),
                got: args.len(),
            });
        }
        for (buf, t) in args.iter().zip(&func.args) {
            if buf.len() != t.volume() {
                return Err(RuntimeError::BufferSize {
                    name: t.name().to_owned(),
                    expected: t.volume(),
                    got: buf.len(),
                });
            }
        }

        let arg_count = args.len();
        let mut temps: Vec<Vec<f32>> = func.temps.iter().map(|t| vec![0.0; t.volume()]).collect();
        for stage in &func.stages {
            let slot = if stage.output < arg_count {
                &mut args[stage.output]
            } else {
                &mut temps[stage.output - arg_count]
            };
            let mut out = std::mem::take(slot);
            let finished = {
                let views = args
                    .iter()
                    .chain(temps.iter())
                    .map(|b| b.as_slice())
                    .collect::<Vec<_>>();
                run_stage(stage, &views, &mut out, cancel)
            };
            let slot = if stage.output < arg_count {
                &mut args[stage.output]
            } else {
                &mut temps[stage.output - arg_count]
            };
            *slot = out;
            if !finished {
                return Err(RuntimeError::Cancelled);
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn handle_count(&self) -> usize {
        Arc::strong_count(&self.func)
    }
}

struct StageRun<'a> {
    stage: &'a LoweredStage,
    buffers: &'a [&'a [f32]],
    out: &'a mut [f32],
    values: Vec<i64>,
    cancel: &'a AtomicBool,
}

/// Returns `false` if the stage was cancelled before it finished.
fn run_stage(
    stage: &LoweredStage,
    buffers: &[&[f32]],
    out: &mut [f32],
    cancel: &AtomicBool,
) -> bool {
    if cancel.load(Ordering::Relaxed) {
        return false;
    }
    if stage.reduce {
        out.fill(0.0);
    }
    let mut run = StageRun {
        stage,
        buffers,
        out,
        values: vec![0; stage.loops.len()],
        cancel,
    };
    run.nest(0)
}

impl StageRun<'_> {
    fn nest(&mut self, depth: usize) -> bool {
        let loop_count = self.stage.loops.len();
        if depth == loop_count {
            self.body();
            return true;
        }
        let poll = depth + 1 < loop_count;
        for v in 0..i64::from(self.stage.loops[depth].extent) {
            if poll && self.cancel.load(Ordering::Relaxed) {
                return false;
            }
            self.values[depth] = v;
            if !self.nest(depth + 1) {
                return false;
            }
        }
        true
    }

    #[inline]
    fn body(&mut self) {
        let values = &self.values;
        if self
            .stage
            .guards
            .iter()
            .any(|(a, extent)| a.eval(values) >= i64::from(*extent))
        {
            return;
        }
        let v = eval(&self.stage.body, self.buffers, values);
        let offset = self.stage.store.offset.eval(values) as usize;
        if self.stage.reduce {
            self.out[offset] += v;
        } else {
            self.out[offset] = v;
        }
    }
}

fn eval(expr: &LoweredExpr, buffers: &[&[f32]], values: &[i64]) -> f32 {
    match expr {
        LoweredExpr::Const(c) => *c,
        LoweredExpr::Load(access) => load(access, buffers, values),
        LoweredExpr::Add(lhs, rhs) => eval(lhs, buffers, values) + eval(rhs, buffers, values),
        LoweredExpr::Mul(lhs, rhs) => eval(lhs, buffers, values) * eval(rhs, buffers, values),
    }
}

#[inline]
fn load(access: &Access, buffers: &[&[f32]], values: &[i64]) -> f32 {
    if access.checked {
        let in_bounds = access.indices.iter().zip(&access.shape).all(|(idx, &dim)| {
            let i = idx.eval(values);
            i >= 0 && i < i64::from(dim)
        });
        if !in_bounds {
            return 0.0;
        }
    }
    buffers[access.buffer][access.offset.eval(values) as usize]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lower::lower;
    use crate::schedule::Schedule;
    use crate::workloads::{batch_matmul, conv2d};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn naive_batch_matmul(a: &[f32], b: &[f32], batch: usize, n: usize, l: usize, m: usize) -> Vec<f32> {
        let mut c = vec![0.0; batch * n * m];
        for bi in 0..batch {
            for y in 0..n {
                for x in 0..m {
                    for k in 0..l {
                        c[bi * n * m + y * m + x] +=
                            a[bi * n * l + y * l + k] * b[bi * l * m + k * m + x];
                    }
                }
            }
        }
        c
    }

    fn assert_close(lhs: &[f32], rhs: &[f32]) {
        assert_eq!(lhs.len(), rhs.len());
        for (i, (a, b)) in lhs.iter().zip(rhs).enumerate() {
            assert!((a - b).abs() < 1e-4, "mismatch at {i}: {a} vs {b}");
        }
    }

    #[test]
    fn test_default_gemm_matches_naive() {
        let (ops, bufs) = batch_matmul(&[2, 3, 4, 5]).unwrap();
        let module = Module::new(lower(&Schedule::create(&ops), &bufs, "gemm").unwrap());
        let mut args = module.random_args(&mut StdRng::seed_from_u64(0));
        let expected = naive_batch_matmul(&args[0], &args[1], 2, 3, 4, 5);
        module.run(&mut args).unwrap();
        assert_close(&args[2], &expected);
    }

    #[test]
    fn test_tiled_gemm_with_guards_matches_naive() {
        let (ops, bufs) = batch_matmul(&[1, 7, 5, 6]).unwrap();
        let mut s = Schedule::create(&ops);
        let stage = s.stage_mut(&bufs[2]).unwrap();
        let axes = stage.axis();
        let k = stage.reduce_axis()[0];
        let (yo, yi) = stage.split(axes[1], 3).unwrap();
        let (xo, xi) = stage.split(axes[2], 4).unwrap();
        let (ko, ki) = stage.split(k, 2).unwrap();
        stage.reorder(&[xo, yo, ko, xi, ki, yi]).unwrap();
        stage.vectorize(yi).unwrap();

        let module = Module::new(lower(&s, &bufs, "gemm").unwrap());
        let mut args = module.random_args(&mut StdRng::seed_from_u64(1));
        let expected = naive_batch_matmul(&args[0], &args[1], 1, 7, 5, 6);
        module.run(&mut args).unwrap();
        assert_close(&args[2], &expected);
    }

    #[test]
    fn test_padded_conv_identity_kernel() {
        // A 3x3 kernel with a single centered 1 reproduces the input.
        let (ops, bufs) = conv2d(&[1, 1, 4, 4, 1, 3, 3, 1, 1, 1, 1, 1, 1]).unwrap();
        let module = Module::new(lower(&Schedule::create(&ops), &bufs, "conv").unwrap());
        let data = (0..16).map(|i| i as f32).collect::<Vec<_>>();
        let mut kernel = vec![0.0; 9];
        kernel[4] = 1.0;
        let mut args = vec![data.clone(), kernel, vec![0.0; 16]];
        module.run(&mut args).unwrap();
        assert_close(&args[2], &data);
    }

    #[test]
    fn test_run_rejects_wrong_buffers() {
        let (ops, bufs) = batch_matmul(&[1, 2, 2, 2]).unwrap();
        let module = Module::new(lower(&Schedule::create(&ops), &bufs, "gemm").unwrap());
        assert_eq!(
            module.run(&mut [vec![0.0; 4], vec![0.0; 4]]),
            Err(RuntimeError::BufferCount {
                expected: 3,
                got: 2
            })
        );
        assert!(matches!(
            module.run(&mut [vec![0.0; 4], vec![0.0; 4], vec![0.0; 3]]),
            Err(RuntimeError::BufferSize { .. })
        ));
    }

    #[test]
    fn test_rerun_does_not_accumulate() {
        let (ops, bufs) = batch_matmul(&[1, 2, 2, 2]).unwrap();
        let module = Module::new(lower(&Schedule::create(&ops), &bufs, "gemm").unwrap());
        let mut args = vec![vec![1.0; 4], vec![1.0; 4], vec![0.0; 4]];
        module.run(&mut args).unwrap();
        module.run(&mut args).unwrap();
        assert_close(&args[2], &[2.0; 4]);
    }

    #[test]
    fn test_cancelled_run_stops_early() {
        let (ops, bufs) = batch_matmul(&[1, 512, 512, 512]).unwrap();
        let module = Module::new(lower(&Schedule::create(&ops), &bufs, "gemm").unwrap());
        let mut args = vec![vec![1.0; 512 * 512]; 3];
        let cancel = AtomicBool::new(true);
        assert_eq!(
            module.run_cancellable(&mut args, &cancel),
            Err(RuntimeError::Cancelled)
        );
        // Every buffer is handed back, even though the run stopped.
        assert!(args.iter().all(|b| b.len() == 512 * 512));

        cancel.store(false, Ordering::Relaxed);
        let (ops, bufs) = batch_matmul(&[1, 2, 2, 2]).unwrap();
        let small = Module::new(lower(&Schedule::create(&ops), &bufs, "gemm").unwrap());
        let mut args = vec![vec![1.0; 4], vec![1.0; 4], vec![0.0; 4]];
        small.run_cancellable(&mut args, &cancel).unwrap();
        assert_close(&args[2], &[2.0; 4]);
    }
}
