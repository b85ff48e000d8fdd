//! Building and timing candidate configurations.

mod builder;
mod runner;

pub use builder::{BuildArtifact, LocalBuilder};
pub use runner::LocalRunner;

use crate::space::ConfigEntity;
use crate::target::TargetId;
use crate::task::Task;
use crate::utils::mean;

use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// A configuration of a task to be measured.
#[derive(Debug, Clone)]
pub struct MeasureInput {
    pub target: TargetId,
    pub task: Arc<Task>,
    pub config: ConfigEntity,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeasureResult {
    /// Seconds per run, one entry per repeat. Empty when `error_no` is not
    /// [MeasureErrorNo::NoError].
    pub costs: Vec<f64>,
    pub error_no: MeasureErrorNo,
    pub error_msg: Option<String>,
    /// Wall-clock seconds spent building and running.
    pub all_cost: f64,
    /// Seconds since the Unix epoch at which the measurement finished.
    pub timestamp: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MeasureErrorNo {
    NoError = 0,
    InstantiationError = 1,
    CompileHostError = 2,
    RuntimeDeviceError = 4,
    WrongAnswerError = 5,
    BuildTimeoutError = 6,
    RunTimeoutError = 7,
    UnknownError = 8,
}

#[derive(thiserror::Error, Debug, PartialEq)]
#[error("Unknown measure error number {0}")]
pub struct UnknownErrorNo(u8);

/// Where and how candidates are built and run.
#[derive(Debug, Clone, Default)]
pub struct MeasureOption {
    pub builder: LocalBuilder,
    pub runner: LocalRunner,
}

impl MeasureResult {
    pub fn error(error_no: MeasureErrorNo, msg: impl Into<String>, all_cost: f64) -> Self {
        MeasureResult {
            costs: vec![],
            error_no,
            error_msg: Some(msg.into()),
            all_cost,
            timestamp: now(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error_no == MeasureErrorNo::NoError
    }

    /// Mean seconds per run, if the measurement succeeded.
    pub fn mean_cost(&self) -> Option<f64> {
        if self.is_ok() {
            mean(&self.costs)
        } else {
            None
        }
    }
}

impl fmt::Display for MeasureResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MeasureResult(costs=(")?;
        for c in &self.costs {
            write!(f, "{c:.6e},")?;
        }
        write!(
            f,
            "), error_no={}, all_cost={:.3}, timestamp={:.3})",
            u8::from(self.error_no),
            self.all_cost,
            self.timestamp
        )
    }
}

impl From<MeasureErrorNo> for u8 {
    fn from(value: MeasureErrorNo) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for MeasureErrorNo {
    type Error = UnknownErrorNo;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => MeasureErrorNo::NoError,
            1 => MeasureErrorNo::InstantiationError,
            2 => MeasureErrorNo::CompileHostError,
            4 => MeasureErrorNo::RuntimeDeviceError,
            5 => MeasureErrorNo::WrongAnswerError,
            6 => MeasureErrorNo::BuildTimeoutError,
            7 => MeasureErrorNo::RunTimeoutError,
            8 => MeasureErrorNo::UnknownError,
            other => return Err(UnknownErrorNo(other)),
        })
    }
}

impl MeasureOption {
    /// Builds every input in parallel, then runs the successful builds one at a
    /// time so that runs do not disturb each other's timings.
    pub fn measure_batch(&self, inputs: &[MeasureInput]) -> Vec<MeasureResult> {
        let start = Instant::now();
        let builds = self
            .builder
            .build_batch(inputs, self.runner.check_correctness);
        debug!(
            "Built {} candidates in {:?}",
            inputs.len(),
            start.elapsed()
        );
        builds
            .into_iter()
            .map(|build| match build {
                Ok(artifact) => self.runner.run(&artifact),
                Err(failure) => failure,
            })
            .collect()
    }
}

pub(crate) fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
