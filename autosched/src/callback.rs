//! Hooks run after every measured batch of a tuning session.

use crate::measure::{MeasureInput, MeasureResult};
use crate::record::{Record, RecordError};
use crate::tuner::TuneProgress;

use indicatif::{ProgressBar, ProgressStyle};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum CallbackError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Record error: {0}")]
    Record(#[from] RecordError),
}

pub trait Callback {
    fn call(
        &mut self,
        progress: &TuneProgress,
        inputs: &[MeasureInput],
        results: &[MeasureResult],
    ) -> Result<(), CallbackError>;

    /// Called once when the session ends, including early stops.
    fn finish(&mut self) {}
}

impl<F> Callback for F
where
    F: FnMut(&TuneProgress, &[MeasureInput], &[MeasureResult]) -> Result<(), CallbackError>,
{
    fn call(
        &mut self,
        progress: &TuneProgress,
        inputs: &[MeasureInput],
        results: &[MeasureResult],
    ) -> Result<(), CallbackError> {
        self(progress, inputs, results)
    }
}

/// Appends a [Record] per measurement to a log file.
pub struct LogToFile {
    writer: BufWriter<File>,
}

pub fn log_to_file(path: impl AsRef<Path>) -> Result<LogToFile, CallbackError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path.as_ref())?;
    Ok(LogToFile {
        writer: BufWriter::new(file),
    })
}

impl Callback for LogToFile {
    fn call(
        &mut self,
        _progress: &TuneProgress,
        inputs: &[MeasureInput],
        results: &[MeasureResult],
    ) -> Result<(), CallbackError> {
        for (input, result) in inputs.iter().zip(results) {
            writeln!(self.writer, "{}", Record::new(input, result).encode()?)?;
        }
        // Flushed per batch so that an interrupted session keeps its log.
        self.writer.flush()?;
        Ok(())
    }
}

/// Draws a progress bar showing the best GFLOPS so far.
pub struct ProgressBarCallback {
    pb: ProgressBar,
}

pub fn progress_bar(total: usize, prefix: &str) -> ProgressBarCallback {
    let pb = ProgressBar::new(total as u64);
    if let Ok(style) =
        ProgressStyle::with_template("{prefix:>12.cyan.bold} [{bar:24}] {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("=> "));
    }
    pb.set_prefix(prefix.to_owned());
    ProgressBarCallback { pb }
}

impl Callback for ProgressBarCallback {
    fn call(
        &mut self,
        progress: &TuneProgress,
        _inputs: &[MeasureInput],
        _results: &[MeasureResult],
    ) -> Result<(), CallbackError> {
        self.pb.set_length(progress.n_trial as u64);
        self.pb.set_position(progress.trial as u64);
        self.pb
            .set_message(format!("best {:.2} GFLOPS", progress.best_flops / 1e9));
        Ok(())
    }

    fn finish(&mut self) {
        self.pb.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measure::MeasureErrorNo;
    use crate::record::load_from_file;
    use crate::target::TargetId;
    use crate::tuner::tests::gemm_task;
    use std::sync::Arc;

    fn batch(n: u64) -> (Arc<crate::task::Task>, Vec<MeasureInput>, Vec<MeasureResult>) {
        let task = gemm_task([1, 4, 4, 4]);
        let inputs = (0..n)
            .map(|i| MeasureInput {
                target: TargetId::Llvm,
                task: Arc::clone(&task),
                config: task.config_space.get(i).unwrap(),
            })
            .collect::<Vec<_>>();
        let results = (0..n)
            .map(|i| MeasureResult {
                costs: vec![1.0 + i as f64],
                error_no: MeasureErrorNo::NoError,
                error_msg: None,
                all_cost: 0.0,
                timestamp: 0.0,
            })
            .collect();
        (task, inputs, results)
    }

    #[test]
    fn test_log_to_file_appends_one_line_per_result() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tune.log");
        let (task, inputs, results) = batch(3);
        let progress = TuneProgress {
            task: &task,
            trial: 3,
            n_trial: 10,
            best_flops: 0.0,
        };
        let mut cb = log_to_file(&path).unwrap();
        cb.call(&progress, &inputs, &results).unwrap();
        cb.call(&progress, &inputs[..1], &results[..1]).unwrap();
        cb.finish();

        let records = load_from_file(&path).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(
            records.iter().map(|r| r.config.index).collect::<Vec<_>>(),
            vec![0, 1, 2, 0]
        );
        assert_eq!(records[2].result.costs, vec![3.0]);
    }

    #[test]
    fn test_progress_bar_tracks_trials() {
        let (task, inputs, results) = batch(2);
        let mut cb = progress_bar(10, "Tuning");
        let progress = TuneProgress {
            task: &task,
            trial: 2,
            n_trial: 8,
            best_flops: 2e9,
        };
        cb.call(&progress, &inputs, &results).unwrap();
        assert_eq!(cb.pb.position(), 2);
        assert_eq!(cb.pb.length(), Some(8));
        assert_eq!(cb.pb.message(), "best 2.00 GFLOPS");
        cb.finish();
    }
}
