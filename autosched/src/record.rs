//! Tuning logs: one JSON object per line, one line per measured configuration.

use crate::common::DimSize;
use crate::measure::{MeasureErrorNo, MeasureInput, MeasureResult};
use crate::space::ConfigEntity;
use crate::target::TargetId;
use crate::task::{workload_key, Task};
use crate::utils::mean;

use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

pub const LOG_VERSION: &str = "0.1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub input: RecordInput,
    pub config: RecordConfig,
    pub result: RecordResult,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordInput {
    pub target: TargetId,
    pub task: String,
    pub args: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordConfig {
    pub index: u64,
    /// Chosen factors of every knob, in definition order.
    pub entity: Vec<(String, Vec<DimSize>)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordResult {
    pub costs: Vec<f64>,
    pub error_no: MeasureErrorNo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    pub all_cost: f64,
    pub timestamp: f64,
}

#[derive(thiserror::Error, Debug)]
pub enum RecordError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Malformed record: {0}")]
    Json(#[from] serde_json::Error),
}

/// The best error-free record of every (target, workload) in a log.
#[derive(Debug, Clone, Default)]
pub struct ApplyHistoryBest {
    best: HashMap<(TargetId, String), Record>,
}

impl Record {
    pub fn new(input: &MeasureInput, result: &MeasureResult) -> Self {
        Record {
            input: RecordInput {
                target: input.target,
                task: input.task.name.clone(),
                args: input.task.args.clone(),
            },
            config: RecordConfig {
                index: input.config.index,
                entity: input
                    .config
                    .entities
                    .iter()
                    .map(|(name, e)| (name.clone(), e.size.to_vec()))
                    .collect(),
            },
            result: RecordResult {
                costs: result.costs.clone(),
                error_no: result.error_no,
                error_msg: result.error_msg.clone(),
                all_cost: result.all_cost,
                timestamp: result.timestamp,
            },
            version: LOG_VERSION.to_owned(),
        }
    }

    pub fn encode(&self) -> Result<String, RecordError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(line: &str) -> Result<Self, RecordError> {
        Ok(serde_json::from_str(line)?)
    }

    pub fn workload_key(&self) -> String {
        workload_key(&self.input.task, &self.input.args)
    }

    /// Mean seconds per run, if the measurement succeeded.
    pub fn mean_cost(&self) -> Option<f64> {
        if self.result.error_no != MeasureErrorNo::NoError {
            return None;
        }
        mean(&self.result.costs)
    }

    /// Whether `entity` chose the same factors as this record.
    fn matches(&self, entity: &ConfigEntity) -> bool {
        entity.entities.len() == self.config.entity.len()
            && entity
                .entities
                .iter()
                .zip(&self.config.entity)
                .all(|((name, e), (rname, rsize))| name == rname && e.size.as_slice() == rsize)
    }
}

/// Reads every record of a log file.
///
/// Lines which do not parse are skipped with a warning, so a log cut short by
/// an interrupted session stays usable.
pub fn load_from_file(path: impl AsRef<Path>) -> Result<Vec<Record>, RecordError> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    let mut records = vec![];
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match Record::decode(&line) {
            Ok(r) => records.push(r),
            Err(e) => warn!("Skipping line {} of {}: {}", lineno + 1, path.display(), e),
        }
    }
    Ok(records)
}

impl ApplyHistoryBest {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RecordError> {
        Ok(Self::from_records(load_from_file(path)?))
    }

    pub fn from_records(records: impl IntoIterator<Item = Record>) -> Self {
        let mut best: HashMap<(TargetId, String), Record> = HashMap::new();
        for record in records {
            let Some(cost) = record.mean_cost() else {
                continue;
            };
            let key = (record.input.target, record.workload_key());
            match best.get(&key).and_then(Record::mean_cost) {
                Some(existing) if existing <= cost => {}
                _ => {
                    best.insert(key, record);
                }
            }
        }
        ApplyHistoryBest { best }
    }

    pub fn len(&self) -> usize {
        self.best.len()
    }

    pub fn is_empty(&self) -> bool {
        self.best.is_empty()
    }

    pub fn best(&self, target: TargetId, workload_key: &str) -> Option<&Record> {
        self.best.get(&(target, workload_key.to_owned()))
    }

    /// The best logged configuration of `task`, if one exists and still
    /// matches the task's configuration space.
    pub fn query(&self, task: &Task) -> Option<ConfigEntity> {
        let record = self.best(task.target, &task.workload_key())?;
        match task.config_space.get(record.config.index) {
            Ok(entity) if record.matches(&entity) => Some(entity),
            _ => {
                warn!(
                    "Logged config {} of {} does not match its configuration space",
                    record.config.index,
                    task.workload_key()
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::GemmTemplate;
    use crate::workloads::batch_matmul;
    use std::io::Write;
    use std::sync::Arc;

    fn gemm_task() -> Arc<Task> {
        let args = [1, 8, 4, 6];
        let (ops, bufs) = batch_matmul(&args).unwrap();
        Arc::new(
            Task::create(Arc::new(GemmTemplate::new(ops, bufs)), &args, TargetId::Llvm).unwrap(),
        )
    }

    fn record(task: &Arc<Task>, index: u64, costs: Vec<f64>, error_no: MeasureErrorNo) -> Record {
        let input = MeasureInput {
            target: TargetId::Llvm,
            task: Arc::clone(task),
            config: task.config_space.get(index).unwrap(),
        };
        let result = MeasureResult {
            costs,
            error_no,
            error_msg: None,
            all_cost: 0.5,
            timestamp: 1700000000.0,
        };
        Record::new(&input, &result)
    }

    #[test]
    fn test_encoded_record_layout() {
        let task = gemm_task();
        let r = record(&task, 1, vec![0.25], MeasureErrorNo::NoError);
        let value: serde_json::Value = serde_json::from_str(&r.encode().unwrap()).unwrap();
        assert_eq!(value["input"]["target"], "llvm");
        assert_eq!(value["input"]["task"], "gemm");
        assert_eq!(value["input"]["args"], serde_json::json!([1, 8, 4, 6]));
        assert_eq!(value["config"]["index"], 1);
        assert_eq!(value["config"]["entity"][0][0], "split_k");
        assert_eq!(value["result"]["error_no"], 0);
        assert!(value["result"].get("error_msg").is_none());
        assert_eq!(Record::decode(&r.encode().unwrap()).unwrap(), r);
    }

    #[test]
    fn test_load_skips_malformed_lines() {
        let task = gemm_task();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let good = record(&task, 2, vec![1.0], MeasureErrorNo::NoError);
        writeln!(file, "{}", good.encode().unwrap()).unwrap();
        writeln!(file, "{{\"input\": truncated").unwrap();
        writeln!(file).unwrap();
        let records = load_from_file(file.path()).unwrap();
        assert_eq!(records, vec![good]);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_from_file(dir.path().join("absent.log")),
            Err(RecordError::Io(_))
        ));
    }

    #[test]
    fn test_history_best_picks_lowest_error_free_cost() {
        let task = gemm_task();
        let records = vec![
            record(&task, 3, vec![2.0, 2.0], MeasureErrorNo::NoError),
            record(&task, 5, vec![0.5, 1.5], MeasureErrorNo::NoError),
            record(&task, 7, vec![], MeasureErrorNo::RunTimeoutError),
            record(&task, 9, vec![3.0], MeasureErrorNo::NoError),
        ];
        let history = ApplyHistoryBest::from_records(records);
        assert_eq!(history.len(), 1);
        assert_eq!(history.query(&task).unwrap().index, 5);
    }

    #[test]
    fn test_query_of_other_workload_is_none() {
        let task = gemm_task();
        let history =
            ApplyHistoryBest::from_records(vec![record(&task, 0, vec![1.0], MeasureErrorNo::NoError)]);
        let args = [1, 8, 4, 12];
        let (ops, bufs) = batch_matmul(&args).unwrap();
        let other =
            Task::create(Arc::new(GemmTemplate::new(ops, bufs)), &args, TargetId::Llvm).unwrap();
        assert!(history.query(&other).is_none());
    }

    #[test]
    fn test_query_rejects_stale_entity() {
        let task = gemm_task();
        let mut r = record(&task, 4, vec![1.0], MeasureErrorNo::NoError);
        r.config.entity[0].1 = vec![7, 7];
        let history = ApplyHistoryBest::from_records(vec![r]);
        assert!(history.query(&task).is_none());
    }

    #[test]
    fn test_mean_cost_of_record() {
        let task = gemm_task();
        assert_eq!(
            record(&task, 0, vec![0.5, 1.5], MeasureErrorNo::NoError).mean_cost(),
            Some(1.0)
        );
        assert_eq!(record(&task, 0, vec![], MeasureErrorNo::NoError).mean_cost(), None);
        assert_eq!(
            record(&task, 0, vec![1.0], MeasureErrorNo::WrongAnswerError).mean_cost(),
            None
        );
    }
}
