use super::Tuner;
use crate::measure::{MeasureInput, MeasureResult};
use crate::space::ConfigEntity;
use crate::task::Task;

use std::sync::Arc;

/// Enumerates the configuration space in index order.
pub struct GridSearchTuner {
    task: Arc<Task>,
    counter: u64,
}

impl GridSearchTuner {
    pub fn new(task: Arc<Task>) -> Self {
        GridSearchTuner { task, counter: 0 }
    }
}

impl Tuner for GridSearchTuner {
    fn task(&self) -> &Arc<Task> {
        &self.task
    }

    fn next_batch(&mut self, batch_size: usize) -> Vec<ConfigEntity> {
        let space = &self.task.config_space;
        let end = space.len().min(self.counter + batch_size as u64);
        let batch = (self.counter..end)
            .filter_map(|i| space.get(i).ok())
            .collect();
        self.counter = end;
        batch
    }

    fn update(&mut self, _inputs: &[MeasureInput], _results: &[MeasureResult]) {}

    fn has_next(&self) -> bool {
        self.counter < self.task.config_space.len()
    }
}
