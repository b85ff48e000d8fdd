//! The tuning driver: define, pick a template, tune, replay the best.

use crate::callback::{log_to_file, progress_bar, Callback, CallbackError};
use crate::measure::{LocalRunner, MeasureOption};
use crate::pprint::space_string;
use crate::record::{ApplyHistoryBest, RecordError};
use crate::schedule::Schedule;
use crate::target::TargetId;
use crate::task::Task;
use crate::template::{select_template, TemplateError};
use crate::tensor::{DefinitionError, Tensor};
use crate::tuner::{make_tuner, TuneSummary, TunerKind};
use crate::workloads::Definition;

use log::{debug, info, warn};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DEFAULT_N_TRIAL: usize = 100;
pub const DEFAULT_LOG_FILE: &str = "tune.log";
pub const DEFAULT_NUMBER: usize = 5;

#[derive(Debug, Clone)]
pub struct TuneOptions {
    pub n_trial: usize,
    /// Removed at the start of every session, then appended to per trial.
    pub log_file: PathBuf,
    pub tuner: TunerKind,
    pub measure: MeasureOption,
    pub early_stopping: Option<usize>,
    pub target: TargetId,
    pub seed: Option<u64>,
    pub progress: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum AutoScheduleError {
    #[error("Invalid computation definition: {0}")]
    Definition(#[from] DefinitionError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("Tuning callback failed: {0}")]
    Callback(#[from] CallbackError),
    #[error("Could not read tuning log: {0}")]
    Record(#[from] RecordError),
    #[error("Could not remove old tuning log {path}: {source}")]
    RemoveLog { path: PathBuf, source: io::Error },
}

impl Default for TuneOptions {
    fn default() -> Self {
        TuneOptions {
            n_trial: DEFAULT_N_TRIAL,
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            tuner: TunerKind::default(),
            measure: MeasureOption {
                runner: LocalRunner {
                    number: DEFAULT_NUMBER,
                    ..Default::default()
                },
                ..Default::default()
            },
            early_stopping: None,
            target: TargetId::default(),
            seed: None,
            progress: false,
        }
    }
}

/// Defines the computation `func(args)`, tunes it and returns the best
/// schedule found along with its buffers.
///
/// The template is chosen by the number of arguments: 4 for a batched
/// matmul, 13 for a convolution. Any other count skips tuning and returns
/// the default schedule.
pub fn auto_schedule<F>(
    func: F,
    args: &[i64],
    options: &TuneOptions,
) -> Result<(Schedule, Vec<Tensor>), AutoScheduleError>
where
    F: FnOnce(&[i64]) -> Result<Definition, DefinitionError>,
{
    let (ops, bufs) = func(args)?;
    let Some(template) = select_template(ops.clone(), bufs.clone(), args) else {
        warn!("unknown operation");
        return Ok((Schedule::create(&ops), bufs));
    };

    let task = Arc::new(Task::create(template, args, options.target)?);
    info!("{}", task.config_space);
    debug!("Knobs:\n{}", space_string(&task.config_space));

    info!("=====begin tuning for {:?}", args);
    remove_log(&options.log_file)?;
    let summary = tune_task(&task, options)?;
    info!(
        "=====finish tuning for {:?} ({} trials, {} errors, best {:.2} GFLOPS)",
        args,
        summary.trials,
        summary.errors,
        summary.best_flops / 1e9
    );

    apply_history_best(&task, &options.log_file)
}

/// Runs one tuning session for `task`, appending every measurement to
/// `options.log_file`.
pub fn tune_task(task: &Arc<Task>, options: &TuneOptions) -> Result<TuneSummary, AutoScheduleError> {
    let mut tuner = make_tuner(options.tuner, Arc::clone(task), options.seed);
    let mut callbacks: Vec<Box<dyn Callback>> = vec![Box::new(log_to_file(&options.log_file)?)];
    if options.progress {
        callbacks.push(Box::new(progress_bar(options.n_trial, "Tuning")));
    }
    Ok(tuner.tune(
        options.n_trial,
        &options.measure,
        options.early_stopping,
        &mut callbacks,
    )?)
}

/// Instantiates `task` with the best configuration logged in `log_file`,
/// or with the first candidate of every knob if the log has none.
pub fn apply_history_best(
    task: &Task,
    log_file: &Path,
) -> Result<(Schedule, Vec<Tensor>), AutoScheduleError> {
    let history = if log_file.exists() {
        ApplyHistoryBest::load(log_file)?
    } else {
        ApplyHistoryBest::default()
    };
    match history.query(task) {
        Some(config) => {
            info!("Applying best config {}", config);
            Ok(task.instantiate(&config)?)
        }
        None => {
            warn!(
                "Cannot find config for target={}, workload={}. A fallback configuration is used.",
                task.target,
                task.workload_key()
            );
            Ok(task.instantiate_fallback()?)
        }
    }
}

fn remove_log(path: &Path) -> Result<(), AutoScheduleError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(AutoScheduleError::RemoveLog {
            path: path.to_owned(),
            source,
        }),
    }
}
