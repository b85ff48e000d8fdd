//! Search strategies over a task's configuration space.

mod ga;
mod grid;
mod random;

pub use ga::GaTuner;
pub use grid::GridSearchTuner;
pub use random::RandomTuner;

use crate::callback::{Callback, CallbackError};
use crate::measure::{MeasureInput, MeasureOption, MeasureResult};
use crate::space::ConfigEntity;
use crate::task::Task;

use log::{debug, info};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum TunerKind {
    Grid,
    Random,
    #[default]
    Ga,
}

/// What a tuning session has seen so far. Passed to [Callback]s.
#[derive(Debug, Clone)]
pub struct TuneProgress<'a> {
    pub task: &'a Task,
    /// Trials measured so far.
    pub trial: usize,
    pub n_trial: usize,
    pub best_flops: f64,
}

#[derive(Debug, Clone, Default)]
pub struct TuneSummary {
    pub trials: usize,
    pub errors: usize,
    pub best_flops: f64,
    pub best_config: Option<ConfigEntity>,
    /// Zero-based trial at which `best_config` was measured.
    pub best_iter: usize,
}

pub trait Tuner {
    fn task(&self) -> &Arc<Task>;

    /// Proposes up to `batch_size` configurations not proposed before.
    fn next_batch(&mut self, batch_size: usize) -> Vec<ConfigEntity>;

    /// Feeds measurements of proposed configurations back to the tuner.
    fn update(&mut self, inputs: &[MeasureInput], results: &[MeasureResult]);

    fn has_next(&self) -> bool;

    /// Measures up to `n_trial` configurations, at most the size of the space.
    ///
    /// Stops early once `early_stopping` trials pass without a new best.
    fn tune(
        &mut self,
        n_trial: usize,
        measure_option: &MeasureOption,
        early_stopping: Option<usize>,
        callbacks: &mut [Box<dyn Callback>],
    ) -> Result<TuneSummary, CallbackError> {
        let task = Arc::clone(self.task());
        let space_len = usize::try_from(task.config_space.len()).unwrap_or(usize::MAX);
        let n_trial = n_trial.min(space_len);
        let n_parallel = measure_option.builder.n_parallel.max(1);

        let mut summary = TuneSummary::default();
        while summary.trials < n_trial && self.has_next() {
            let configs = self.next_batch(n_parallel.min(n_trial - summary.trials));
            if configs.is_empty() {
                break;
            }
            let inputs = configs
                .into_iter()
                .map(|config| MeasureInput {
                    target: task.target,
                    task: Arc::clone(&task),
                    config,
                })
                .collect::<Vec<_>>();
            let results = measure_option.measure_batch(&inputs);

            for (k, (input, result)) in inputs.iter().zip(&results).enumerate() {
                let flops = flops_of(&task, result);
                if flops > summary.best_flops {
                    summary.best_flops = flops;
                    summary.best_config = Some(input.config.clone());
                    summary.best_iter = summary.trials + k;
                }
                if !result.is_ok() {
                    summary.errors += 1;
                }
                debug!(
                    "No: {}\tGFLOPS: {:.2}/{:.2}\tresult: {}\t{}",
                    summary.trials + k + 1,
                    flops / 1e9,
                    summary.best_flops / 1e9,
                    result,
                    input.config
                );
            }
            summary.trials += results.len();

            self.update(&inputs, &results);
            let progress = TuneProgress {
                task: &task,
                trial: summary.trials,
                n_trial,
                best_flops: summary.best_flops,
            };
            for callback in callbacks.iter_mut() {
                callback.call(&progress, &inputs, &results)?;
            }

            if let Some(early_stopping) = early_stopping {
                if summary.trials >= summary.best_iter + early_stopping {
                    info!("Early stopped. Best iter: {}.", summary.best_iter);
                    break;
                }
            }
        }
        for callback in callbacks.iter_mut() {
            callback.finish();
        }
        Ok(summary)
    }
}

/// Measured FLOP/s of a result; zero for failures.
pub fn flops_of(task: &Task, result: &MeasureResult) -> f64 {
    match result.mean_cost() {
        Some(cost) if cost > 0.0 => task.flop / cost,
        _ => 0.0,
    }
}

pub fn make_tuner(kind: TunerKind, task: Arc<Task>, seed: Option<u64>) -> Box<dyn Tuner> {
    match kind {
        TunerKind::Grid => Box::new(GridSearchTuner::new(task)),
        TunerKind::Random => Box::new(RandomTuner::new(task, seed)),
        TunerKind::Ga => Box::new(GaTuner::new(task, seed)),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::measure::{LocalBuilder, LocalRunner};
    use crate::target::TargetId;
    use crate::template::GemmTemplate;
    use crate::workloads::batch_matmul;
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::rc::Rc;

    pub(crate) fn gemm_task(args: [i64; 4]) -> Arc<Task> {
        let (ops, bufs) = batch_matmul(&args).unwrap();
        Arc::new(
            Task::create(Arc::new(GemmTemplate::new(ops, bufs)), &args, TargetId::Llvm).unwrap(),
        )
    }

    pub(crate) fn quick_measure() -> MeasureOption {
        MeasureOption {
            builder: LocalBuilder {
                n_parallel: 4,
                ..Default::default()
            },
            runner: LocalRunner {
                number: 1,
                repeat: 1,
                ..Default::default()
            },
        }
    }

    /// Drains a tuner, checking it never proposes a configuration twice.
    pub(crate) fn drain_unique(tuner: &mut dyn Tuner) -> HashSet<u64> {
        let mut seen = HashSet::new();
        while tuner.has_next() {
            let batch = tuner.next_batch(5);
            assert!(!batch.is_empty(), "has_next promised more configurations");
            for c in &batch {
                assert!(seen.insert(c.index), "{} proposed twice", c.index);
            }
            let inputs = batch
                .into_iter()
                .map(|config| MeasureInput {
                    target: TargetId::Llvm,
                    task: Arc::clone(tuner.task()),
                    config,
                })
                .collect::<Vec<_>>();
            let results = inputs
                .iter()
                .map(|i| MeasureResult {
                    costs: vec![1.0 / (1.0 + i.config.index as f64)],
                    error_no: crate::measure::MeasureErrorNo::NoError,
                    error_msg: None,
                    all_cost: 0.0,
                    timestamp: 0.0,
                })
                .collect::<Vec<_>>();
            tuner.update(&inputs, &results);
        }
        seen
    }

    struct BatchSizes(Rc<RefCell<Vec<(usize, usize)>>>);

    impl Callback for BatchSizes {
        fn call(
            &mut self,
            progress: &TuneProgress,
            inputs: &[MeasureInput],
            _results: &[MeasureResult],
        ) -> Result<(), CallbackError> {
            self.0.borrow_mut().push((progress.trial, inputs.len()));
            Ok(())
        }
    }

    #[test]
    fn test_tune_caps_trials_at_space_size() {
        let task = gemm_task([1, 2, 2, 2]);
        assert_eq!(task.config_space.len(), 8);
        let mut tuner = GridSearchTuner::new(Arc::clone(&task));
        let summary = tuner.tune(100, &quick_measure(), None, &mut []).unwrap();
        assert_eq!(summary.trials, 8);
        assert_eq!(summary.errors, 0);
        assert!(summary.best_flops > 0.0);
        assert!(summary.best_config.is_some());
        assert!(summary.best_iter < 8);
    }

    #[test]
    fn test_tune_invokes_callbacks_per_batch() {
        let task = gemm_task([1, 4, 2, 4]);
        let mut tuner = RandomTuner::new(Arc::clone(&task), Some(3));
        let seen = Rc::new(RefCell::new(vec![]));
        let mut callbacks: Vec<Box<dyn Callback>> = vec![Box::new(BatchSizes(Rc::clone(&seen)))];
        let summary = tuner.tune(10, &quick_measure(), None, &mut callbacks).unwrap();
        assert_eq!(summary.trials, 10);
        assert_eq!(*seen.borrow(), vec![(4, 4), (8, 4), (10, 2)]);
    }

    #[test]
    fn test_early_stopping_stops_before_n_trial() {
        let task = gemm_task([1, 8, 8, 8]);
        let mut tuner = GridSearchTuner::new(Arc::clone(&task));
        let summary = tuner.tune(64, &quick_measure(), Some(0), &mut []).unwrap();
        // With no patience, the first batch ends the session.
        assert_eq!(summary.trials, 4);
    }
}
