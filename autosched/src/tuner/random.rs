use super::Tuner;
use crate::measure::{MeasureInput, MeasureResult};
use crate::space::ConfigEntity;
use crate::task::Task;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::Arc;

const MAX_REJECTIONS: usize = 64;

/// Samples the configuration space uniformly, without repeats.
pub struct RandomTuner {
    task: Arc<Task>,
    visited: HashSet<u64>,
    rng: StdRng,
}

impl RandomTuner {
    pub fn new(task: Arc<Task>, seed: Option<u64>) -> Self {
        RandomTuner {
            task,
            visited: HashSet::new(),
            rng: seeded_rng(seed),
        }
    }
}

pub(super) fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    }
}

/// Draws an index not in `visited`, or `None` if every index is visited.
///
/// Rejection sampling is used while it is cheap; after too many rejections the
/// first unvisited index after a random start is taken instead.
pub(super) fn sample_unvisited<R: Rng>(rng: &mut R, len: u64, visited: &HashSet<u64>) -> Option<u64> {
    if visited.len() as u64 >= len {
        return None;
    }
    for _ in 0..MAX_REJECTIONS {
        let i = rng.gen_range(0..len);
        if !visited.contains(&i) {
            return Some(i);
        }
    }
    let start = rng.gen_range(0..len);
    (start..len).chain(0..start).find(|i| !visited.contains(i))
}

impl Tuner for RandomTuner {
    fn task(&self) -> &Arc<Task> {
        &self.task
    }

    fn next_batch(&mut self, batch_size: usize) -> Vec<ConfigEntity> {
        let space = &self.task.config_space;
        let mut batch = Vec::with_capacity(batch_size);
        while batch.len() < batch_size {
            let Some(index) = sample_unvisited(&mut self.rng, space.len(), &self.visited) else {
                break;
            };
            self.visited.insert(index);
            if let Ok(config) = space.get(index) {
                batch.push(config);
            }
        }
        batch
    }

    fn update(&mut self, _inputs: &[MeasureInput], _results: &[MeasureResult]) {}

    fn has_next(&self) -> bool {
        (self.visited.len() as u64) < self.task.config_space.len()
    }
}
