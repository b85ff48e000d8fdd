use super::{now, BuildArtifact, MeasureErrorNo, MeasureResult};
use crate::runtime::{Module, RuntimeError};

use crossbeam_channel::RecvTimeoutError;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const INPUT_SEED: u64 = 0;
const RTOL: f32 = 1e-3;
const ATOL: f32 = 1e-4;

/// Times built candidates on the local machine.
#[derive(Debug, Clone)]
pub struct LocalRunner {
    /// Runs averaged into one sample.
    pub number: usize,
    /// Samples per candidate.
    pub repeat: usize,
    /// If non-zero, `number` is raised until every sample takes at least this long.
    pub min_repeat_ms: u64,
    pub timeout: Duration,
    /// Compare outputs against the default schedule of the same computation.
    pub check_correctness: bool,
}

impl Default for LocalRunner {
    fn default() -> Self {
        LocalRunner {
            number: 5,
            repeat: 3,
            min_repeat_ms: 0,
            timeout: Duration::from_secs(10),
            check_correctness: false,
        }
    }
}

impl LocalRunner {
    /// Measures one artifact on a worker thread.
    ///
    /// A run that exceeds the timeout is cancelled and reported as such. The
    /// worker has exited by the time this returns.
    pub fn run(&self, artifact: &BuildArtifact) -> MeasureResult {
        let start = Instant::now();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let cancel = Arc::new(AtomicBool::new(false));
        let runner = self.clone();
        let artifact_owned = artifact.clone();
        let worker_cancel = Arc::clone(&cancel);
        let worker = thread::spawn(move || {
            // Never blocks: the channel has room for the one result.
            let _ = tx.send(runner.time(&artifact_owned, &worker_cancel));
        });

        let received = rx.recv_timeout(self.timeout);
        if matches!(received, Err(RecvTimeoutError::Timeout)) {
            cancel.store(true, Ordering::Relaxed);
        }
        if worker.join().is_err() {
            log::warn!("Measurement thread panicked");
        }

        let all_cost = || artifact.build_cost + start.elapsed().as_secs_f64();
        match received {
            Ok(Ok(costs)) => MeasureResult {
                costs,
                error_no: MeasureErrorNo::NoError,
                error_msg: None,
                all_cost: all_cost(),
                timestamp: now(),
            },
            Ok(Err((error_no, msg))) => MeasureResult::error(error_no, msg, all_cost()),
            Err(RecvTimeoutError::Timeout) => MeasureResult::error(
                MeasureErrorNo::RunTimeoutError,
                format!("run took longer than {:?}", self.timeout),
                all_cost(),
            ),
            Err(RecvTimeoutError::Disconnected) => MeasureResult::error(
                MeasureErrorNo::RuntimeDeviceError,
                "measurement thread exited without a result",
                all_cost(),
            ),
        }
    }

    fn time(
        &self,
        artifact: &BuildArtifact,
        cancel: &AtomicBool,
    ) -> Result<Vec<f64>, (MeasureErrorNo, String)> {
        let module = &artifact.module;
        let mut args = module.random_args(&mut StdRng::seed_from_u64(INPUT_SEED));
        let runtime_err = |e: RuntimeError| match e {
            RuntimeError::Cancelled => (MeasureErrorNo::RunTimeoutError, e.to_string()),
            _ => (MeasureErrorNo::RuntimeDeviceError, e.to_string()),
        };

        // Warm-up; also the run whose output is checked.
        module.run_cancellable(&mut args, cancel).map_err(runtime_err)?;
        if let Some(reference) = &artifact.reference {
            check_against(module, reference, &args, cancel).map_err(|msg| {
                (MeasureErrorNo::WrongAnswerError, msg)
            })?;
        }

        let mut number = self.number.max(1);
        let mut costs = Vec::with_capacity(self.repeat);
        while costs.len() < self.repeat.max(1) {
            let start = Instant::now();
            for _ in 0..number {
                module.run_cancellable(&mut args, cancel).map_err(runtime_err)?;
            }
            let elapsed = start.elapsed();
            let min_repeat = Duration::from_millis(self.min_repeat_ms);
            if elapsed < min_repeat {
                let ratio = min_repeat.as_secs_f64() / elapsed.as_secs_f64().max(1e-6);
                number = (((number as f64) * ratio).ceil() as usize).max(number + 1);
                continue;
            }
            costs.push(elapsed.as_secs_f64() / number as f64);
        }
        Ok(costs)
    }
}

fn check_against(
    module: &Module,
    reference: &Module,
    actual: &[Vec<f32>],
    cancel: &AtomicBool,
) -> Result<(), String> {
    let mut expected = module.random_args(&mut StdRng::seed_from_u64(INPUT_SEED));
    reference
        .run_cancellable(&mut expected, cancel)
        .map_err(|e| e.to_string())?;
    for (buf_idx, (a, e)) in actual.iter().zip(&expected).enumerate() {
        if let Some(i) = a
            .iter()
            .zip(e)
            .position(|(a, e)| (a - e).abs() > ATOL + RTOL * e.abs())
        {
            return Err(format!(
                "buffer {} differs at element {}: {} vs. expected {}",
                module.func().args[buf_idx].name(),
                i,
                a[i],
                e[i]
            ));
        }
    }
    Ok(())
}
