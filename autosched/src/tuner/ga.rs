use super::random::{sample_unvisited, seeded_rng};
use super::{flops_of, Tuner};
use crate::measure::{MeasureInput, MeasureResult};
use crate::space::ConfigEntity;
use crate::task::Task;

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;

const POP_SIZE: usize = 100;
const ELITE_NUM: usize = 3;
const MUTATION_PROB: f64 = 0.1;

/// Genetic search over per-knob candidate indices.
///
/// Each generation is measured in full. The next generation is bred from the
/// current one plus the elites of all earlier generations: parents are drawn
/// in proportion to their measured FLOP/s, combined with a single-point
/// crossover and mutated knob by knob. No configuration is proposed twice.
pub struct GaTuner {
    task: Arc<Task>,
    rng: StdRng,
    pop_size: usize,
    elite_num: usize,
    mutation_prob: f64,
    dims: Vec<usize>,
    visited: HashSet<u64>,
    genes: Vec<Vec<usize>>,
    scores: Vec<f64>,
    elites: Vec<(Vec<usize>, f64)>,
    trial_pt: usize,
}

impl GaTuner {
    pub fn new(task: Arc<Task>, seed: Option<u64>) -> Self {
        Self::with_params(task, seed, POP_SIZE, ELITE_NUM, MUTATION_PROB)
    }

    pub fn with_params(
        task: Arc<Task>,
        seed: Option<u64>,
        pop_size: usize,
        elite_num: usize,
        mutation_prob: f64,
    ) -> Self {
        let space = &task.config_space;
        let len = space.len();
        let pop_size = usize::try_from(len).map_or(pop_size, |l| pop_size.min(l)).max(1);
        let mut rng = seeded_rng(seed);
        let mut visited = HashSet::new();
        let mut genes = Vec::with_capacity(pop_size);
        while genes.len() < pop_size {
            let Some(index) = sample_unvisited(&mut rng, len, &visited) else {
                break;
            };
            visited.insert(index);
            genes.push(space.choices(index));
        }
        GaTuner {
            dims: space.dims(),
            task,
            rng,
            pop_size,
            elite_num: elite_num.min(pop_size),
            mutation_prob,
            visited,
            genes,
            scores: vec![],
            elites: vec![],
            trial_pt: 0,
        }
    }

    fn breed(&mut self) {
        let mut pool = std::mem::take(&mut self.genes)
            .into_iter()
            .zip(std::mem::take(&mut self.scores))
            .chain(std::mem::take(&mut self.elites))
            .collect::<Vec<_>>();
        pool.sort_by(|a, b| b.1.total_cmp(&a.1));
        self.elites = pool.iter().take(self.elite_num).cloned().collect();

        let space_len = self.task.config_space.len();
        let weights = pool.iter().map(|(_, s)| s.max(0.0)).collect::<Vec<_>>();
        let parent_dist = WeightedIndex::new(&weights).ok();
        let max_attempts = self.pop_size * 100;
        let mut attempts = 0;

        let mut next = Vec::with_capacity(self.pop_size);
        while next.len() < self.pop_size && (self.visited.len() as u64) < space_len {
            attempts += 1;
            let gene = if attempts > max_attempts {
                // Crossover keeps landing on visited points; fall back to
                // random exploration of what is left.
                match sample_unvisited(&mut self.rng, space_len, &self.visited) {
                    Some(index) => self.task.config_space.choices(index),
                    None => break,
                }
            } else {
                self.crossover_and_mutate(&pool, parent_dist.as_ref())
            };
            let index = self.task.config_space.index_of(&gene);
            if self.visited.insert(index) {
                next.push(gene);
            }
        }
        self.genes = next;
        self.trial_pt = 0;
    }

    fn crossover_and_mutate(
        &mut self,
        pool: &[(Vec<usize>, f64)],
        parent_dist: Option<&WeightedIndex<f64>>,
    ) -> Vec<usize> {
        let pick = |rng: &mut StdRng| match parent_dist {
            Some(d) => d.sample(rng),
            None => rng.gen_range(0..pool.len()),
        };
        let p1 = &pool[pick(&mut self.rng)].0;
        let p2 = &pool[pick(&mut self.rng)].0;
        let point = if self.dims.is_empty() {
            0
        } else {
            self.rng.gen_range(0..self.dims.len())
        };
        let mut gene = p1[..point]
            .iter()
            .chain(&p2[point..])
            .copied()
            .collect::<Vec<_>>();
        for (g, &dim) in gene.iter_mut().zip(&self.dims) {
            if self.rng.gen_bool(self.mutation_prob) {
                *g = self.rng.gen_range(0..dim);
            }
        }
        gene
    }
}

impl Tuner for GaTuner {
    fn task(&self) -> &Arc<Task> {
        &self.task
    }

    fn next_batch(&mut self, batch_size: usize) -> Vec<ConfigEntity> {
        let end = self.genes.len().min(self.trial_pt + batch_size);
        let batch = self.genes[self.trial_pt..end]
            .iter()
            .filter_map(|g| {
                let index = self.task.config_space.index_of(g);
                self.task.config_space.get(index).ok()
            })
            .collect();
        self.trial_pt = end;
        batch
    }

    fn update(&mut self, _inputs: &[MeasureInput], results: &[MeasureResult]) {
        self.scores
            .extend(results.iter().map(|r| flops_of(&self.task, r)));
        if self.scores.len() >= self.genes.len()
            && (self.visited.len() as u64) < self.task.config_space.len()
        {
            self.breed();
        }
    }

    fn has_next(&self) -> bool {
        self.trial_pt < self.genes.len()
            || (self.visited.len() as u64) < self.task.config_space.len()
    }
}
