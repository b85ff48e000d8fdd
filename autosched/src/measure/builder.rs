use super::{MeasureErrorNo, MeasureInput, MeasureResult};
use crate::lower::lower;
use crate::runtime::Module;
use crate::schedule::Schedule;

use rayon::prelude::*;
use std::time::{Duration, Instant};

/// Instantiates and lowers candidates on the local machine.
#[derive(Debug, Clone)]
pub struct LocalBuilder {
    /// How many candidates are built, and therefore measured, per batch.
    pub n_parallel: usize,
    /// Builds slower than this are reported as timeouts.
    pub timeout: Duration,
}

/// A successfully built candidate.
#[derive(Debug, Clone)]
pub struct BuildArtifact {
    pub module: Module,
    /// The candidate's computation under its default schedule.
    pub reference: Option<Module>,
    pub build_cost: f64,
}

impl Default for LocalBuilder {
    fn default() -> Self {
        LocalBuilder {
            n_parallel: rayon::current_num_threads(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl LocalBuilder {
    pub fn build_batch(
        &self,
        inputs: &[MeasureInput],
        with_reference: bool,
    ) -> Vec<Result<BuildArtifact, MeasureResult>> {
        inputs
            .par_iter()
            .map(|input| self.build(input, with_reference))
            .collect()
    }

    pub fn build(
        &self,
        input: &MeasureInput,
        with_reference: bool,
    ) -> Result<BuildArtifact, MeasureResult> {
        let start = Instant::now();
        let elapsed = || start.elapsed().as_secs_f64();

        let (schedule, bufs) = input.task.instantiate(&input.config).map_err(|e| {
            MeasureResult::error(MeasureErrorNo::InstantiationError, e.to_string(), elapsed())
        })?;
        let func = lower(&schedule, &bufs, &input.task.name).map_err(|e| {
            MeasureResult::error(MeasureErrorNo::CompileHostError, e.to_string(), elapsed())
        })?;
        let reference = if with_reference {
            let ops = schedule
                .stages()
                .iter()
                .map(|s| s.op().clone())
                .collect::<Vec<_>>();
            let default_func = lower(&Schedule::create(&ops), &bufs, &input.task.name)
                .map_err(|e| {
                    MeasureResult::error(
                        MeasureErrorNo::CompileHostError,
                        e.to_string(),
                        elapsed(),
                    )
                })?;
            Some(Module::new(default_func))
        } else {
            None
        };

        if start.elapsed() > self.timeout {
            return Err(MeasureResult::error(
                MeasureErrorNo::BuildTimeoutError,
                format!("build took longer than {:?}", self.timeout),
                elapsed(),
            ));
        }
        Ok(BuildArtifact {
            module: Module::new(func),
            reference,
            build_cost: elapsed(),
        })
    }
}
