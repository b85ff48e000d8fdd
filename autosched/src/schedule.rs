use crate::common::DimSize;
use crate::expr::Affine;
use crate::tensor::{ComputeOp, IterVarKind, Tensor};

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

static NEXT_SCHEDULE_ID: AtomicU32 = AtomicU32::new(0);

/// A handle to an iteration variable of one [Stage].
///
/// Handles are only valid for the stage, of the schedule, that created them.
/// A clone of a schedule accepts the handles of the original.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IterVar {
    schedule: u32,
    stage: usize,
    idx: u32,
}

#[derive(Debug, Clone)]
struct IterVarNode {
    name: String,
    extent: DimSize,
    kind: IterVarKind,
}

#[derive(Debug, Clone)]
enum Relation {
    Split {
        parent: IterVar,
        outer: IterVar,
        inner: IterVar,
        factor: DimSize,
    },
}

/// The loop structure of one [ComputeOp].
///
/// A fresh stage has one loop per root axis, spatial axes outermost. Splits
/// replace a leaf loop by an outer and an inner loop; the leaf order is the
/// loop-nest order, outermost first.
#[derive(Debug, Clone)]
pub struct Stage {
    schedule: u32,
    index: usize,
    op: Arc<ComputeOp>,
    nodes: Vec<IterVarNode>,
    relations: Vec<Relation>,
    leaf: Vec<IterVar>,
    vectorized: HashSet<IterVar>,
}

#[derive(Debug, Clone)]
pub struct Schedule {
    stages: Vec<Stage>,
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ScheduleError {
    #[error("No stage produces tensor {0}")]
    UnknownStage(String),
    #[error("Iteration variable {got} does not belong to stage {expected}")]
    ForeignIterVar { expected: usize, got: String },
    #[error("{0} is not a leaf iteration variable")]
    NotALeaf(String),
    #[error("Split factor must be positive")]
    ZeroFactor,
    #[error("{0} appears more than once in reorder")]
    DuplicateInReorder(String),
}

/// The value of every root axis of a stage as an [Affine] over its leaf loops,
/// plus the guards `value < extent` a non-dividing split requires.
pub(crate) struct LeafMapping {
    pub roots: Vec<Affine>,
    pub guards: Vec<(Affine, DimSize)>,
}

impl Schedule {
    /// Creates the default schedule for `ops`, one stage per op in the given order.
    ///
    /// Producers must precede their consumers.
    pub fn create(ops: &[ComputeOp]) -> Self {
        let id = NEXT_SCHEDULE_ID.fetch_add(1, Ordering::Relaxed);
        Schedule {
            stages: ops
                .iter()
                .enumerate()
                .map(|(i, op)| Stage::new(id, i, Arc::new(op.clone())))
                .collect(),
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, tensor: &Tensor) -> Result<&Stage, ScheduleError> {
        self.stages
            .iter()
            .find(|s| s.op.output.id() == tensor.id())
            .ok_or_else(|| ScheduleError::UnknownStage(tensor.name().to_owned()))
    }

    pub fn stage_mut(&mut self, tensor: &Tensor) -> Result<&mut Stage, ScheduleError> {
        self.stages
            .iter_mut()
            .find(|s| s.op.output.id() == tensor.id())
            .ok_or_else(|| ScheduleError::UnknownStage(tensor.name().to_owned()))
    }
}

impl Stage {
    fn new(schedule: u32, index: usize, op: Arc<ComputeOp>) -> Self {
        let nodes = op
            .root_axes()
            .map(|(a, kind)| IterVarNode {
                name: a.name.clone(),
                extent: a.extent,
                kind,
            })
            .collect::<Vec<_>>();
        let leaf = (0..nodes.len())
            .map(|idx| IterVar {
                schedule,
                stage: index,
                idx: idx as u32,
            })
            .collect();
        Stage {
            schedule,
            index,
            op,
            nodes,
            relations: vec![],
            leaf,
            vectorized: HashSet::new(),
        }
    }

    pub fn op(&self) -> &ComputeOp {
        &self.op
    }

    /// Root spatial iteration variables.
    pub fn axis(&self) -> Vec<IterVar> {
        (0..self.op.axis.len())
            .map(|idx| self.iter_var(idx))
            .collect()
    }

    /// Root reduction iteration variables.
    pub fn reduce_axis(&self) -> Vec<IterVar> {
        (self.op.axis.len()..self.op.root_count())
            .map(|idx| self.iter_var(idx))
            .collect()
    }

    pub fn leaf_iter_vars(&self) -> &[IterVar] {
        &self.leaf
    }

    /// # Panics
    /// If `iv` does not belong to this stage.
    pub fn name(&self, iv: IterVar) -> &str {
        &self.node(iv).name
    }

    /// # Panics
    /// If `iv` does not belong to this stage.
    pub fn extent(&self, iv: IterVar) -> DimSize {
        self.node(iv).extent
    }

    /// # Panics
    /// If `iv` does not belong to this stage.
    pub fn kind(&self, iv: IterVar) -> IterVarKind {
        self.node(iv).kind
    }

    pub fn is_vectorized(&self, iv: IterVar) -> bool {
        self.vectorized.contains(&iv)
    }

    /// Splits `parent` into an outer loop and an inner loop of extent `factor`.
    pub fn split(
        &mut self,
        parent: IterVar,
        factor: DimSize,
    ) -> Result<(IterVar, IterVar), ScheduleError> {
        let pos = self.leaf_position(parent)?;
        if factor == 0 {
            return Err(ScheduleError::ZeroFactor);
        }
        let node = self.nodes[parent.idx as usize].clone();
        let outer = self.push_node(IterVarNode {
            name: format!("{}.outer", node.name),
            extent: node.extent.div_ceil(factor),
            kind: node.kind,
        });
        let inner = self.push_node(IterVarNode {
            name: format!("{}.inner", node.name),
            extent: factor,
            kind: node.kind,
        });
        self.relations.push(Relation::Split {
            parent,
            outer,
            inner,
            factor,
        });
        self.leaf.splice(pos..=pos, [outer, inner]);
        Ok((outer, inner))
    }

    /// Splits `parent` so that the outer loop has `nparts` iterations.
    pub fn split_nparts(
        &mut self,
        parent: IterVar,
        nparts: DimSize,
    ) -> Result<(IterVar, IterVar), ScheduleError> {
        self.check_owned(parent)?;
        if nparts == 0 {
            return Err(ScheduleError::ZeroFactor);
        }
        let factor = self.extent(parent).div_ceil(nparts);
        self.split(parent, factor)
    }

    /// Permutes the given leaf loops among the positions they currently occupy.
    pub fn reorder(&mut self, order: &[IterVar]) -> Result<(), ScheduleError> {
        let mut positions = Vec::with_capacity(order.len());
        let mut seen = HashSet::new();
        for &iv in order {
            positions.push(self.leaf_position(iv)?);
            if !seen.insert(iv) {
                return Err(ScheduleError::DuplicateInReorder(self.name(iv).to_owned()));
            }
        }
        positions.sort_unstable();
        for (pos, &iv) in positions.into_iter().zip(order) {
            self.leaf[pos] = iv;
        }
        Ok(())
    }

    pub fn vectorize(&mut self, iv: IterVar) -> Result<(), ScheduleError> {
        self.leaf_position(iv)?;
        self.vectorized.insert(iv);
        Ok(())
    }

    pub(crate) fn leaf_mapping(&self) -> LeafMapping {
        let leaf_count = self.leaf.len();
        let mut values: Vec<Option<Affine>> = vec![None; self.nodes.len()];
        for (pos, iv) in self.leaf.iter().enumerate() {
            let mut a = Affine::zero(leaf_count);
            a.coeffs[pos] = 1;
            values[iv.idx as usize] = Some(a);
        }

        let mut guards = vec![];
        // Later relations split the children of earlier ones, so walking
        // backwards always finds both children already resolved.
        for rel in self.relations.iter().rev() {
            match rel {
                Relation::Split {
                    parent,
                    outer,
                    inner,
                    factor,
                } => {
                    let outer_val = values[outer.idx as usize]
                        .as_ref()
                        .expect("outer loop should be resolved");
                    let inner_val = values[inner.idx as usize]
                        .as_ref()
                        .expect("inner loop should be resolved");
                    let parent_val = outer_val.scale(i64::from(*factor)).add(inner_val);
                    let parent_extent = self.extent(*parent);
                    if parent_extent % factor != 0 {
                        guards.push((parent_val.clone(), parent_extent));
                    }
                    values[parent.idx as usize] = Some(parent_val);
                }
            }
        }

        let roots = values
            .into_iter()
            .take(self.op.root_count())
            .map(|v| v.expect("every root axis is reachable from the leaves"))
            .collect();
        LeafMapping { roots, guards }
    }

    fn iter_var(&self, idx: usize) -> IterVar {
        IterVar {
            schedule: self.schedule,
            stage: self.index,
            idx: idx as u32,
        }
    }

    fn push_node(&mut self, node: IterVarNode) -> IterVar {
        self.nodes.push(node);
        self.iter_var(self.nodes.len() - 1)
    }

    fn owns(&self, iv: IterVar) -> bool {
        iv.schedule == self.schedule
            && iv.stage == self.index
            && (iv.idx as usize) < self.nodes.len()
    }

    fn node(&self, iv: IterVar) -> &IterVarNode {
        assert!(self.owns(iv), "{iv:?} does not belong to stage {}", self.index);
        &self.nodes[iv.idx as usize]
    }

    fn check_owned(&self, iv: IterVar) -> Result<(), ScheduleError> {
        if !self.owns(iv) {
            return Err(ScheduleError::ForeignIterVar {
                expected: self.index,
                got: format!("{iv:?}"),
            });
        }
        Ok(())
    }

    fn leaf_position(&self, iv: IterVar) -> Result<usize, ScheduleError> {
        self.check_owned(iv)?;
        self.leaf
            .iter()
            .position(|l| *l == iv)
            .ok_or_else(|| ScheduleError::NotALeaf(self.name(iv).to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workloads::batch_matmul;

    fn gemm_schedule() -> (Schedule, Tensor) {
        let (ops, bufs) = batch_matmul(&[1, 8, 6, 4]).unwrap();
        (Schedule::create(&ops), bufs[2].clone())
    }

    fn leaf_names(stage: &Stage) -> Vec<String> {
        stage
            .leaf_iter_vars()
            .iter()
            .map(|&iv| stage.name(iv).to_owned())
            .collect()
    }

    #[test]
    fn test_default_leaf_order_is_spatial_then_reduce() {
        let (s, c) = gemm_schedule();
        let stage = s.stage(&c).unwrap();
        assert_eq!(leaf_names(stage), vec!["b", "y", "x", "k"]);
    }

    #[test]
    fn test_split_replaces_leaf_in_place() {
        let (mut s, c) = gemm_schedule();
        let stage = s.stage_mut(&c).unwrap();
        let y = stage.axis()[1];
        let (yo, yi) = stage.split(y, 3).unwrap();
        assert_eq!(stage.extent(yo), 3);
        assert_eq!(stage.extent(yi), 3);
        assert_eq!(
            leaf_names(stage),
            vec!["b", "y.outer", "y.inner", "x", "k"]
        );
        assert_eq!(stage.split(y, 2), Err(ScheduleError::NotALeaf("y".to_owned())));
    }

    #[test]
    fn test_reorder_permutes_only_listed_positions() {
        let (mut s, c) = gemm_schedule();
        let stage = s.stage_mut(&c).unwrap();
        let axes = stage.axis();
        let (y, x) = (axes[1], axes[2]);
        let k = stage.reduce_axis()[0];
        stage.reorder(&[k, x, y]).unwrap();
        assert_eq!(leaf_names(stage), vec!["b", "k", "x", "y"]);
    }

    #[test]
    fn test_reorder_rejects_duplicates() {
        let (mut s, c) = gemm_schedule();
        let stage = s.stage_mut(&c).unwrap();
        let x = stage.axis()[2];
        assert_eq!(
            stage.reorder(&[x, x]),
            Err(ScheduleError::DuplicateInReorder("x".to_owned()))
        );
    }

    #[test]
    fn test_zero_factor_is_rejected() {
        let (mut s, c) = gemm_schedule();
        let stage = s.stage_mut(&c).unwrap();
        let x = stage.axis()[2];
        assert_eq!(stage.split(x, 0), Err(ScheduleError::ZeroFactor));
        assert_eq!(stage.split_nparts(x, 0), Err(ScheduleError::ZeroFactor));
    }

    #[test]
    fn test_leaf_mapping_of_nested_split() {
        let (mut s, c) = gemm_schedule();
        let stage = s.stage_mut(&c).unwrap();
        let y = stage.axis()[1];
        let (yo, _) = stage.split(y, 4).unwrap();
        stage.split(yo, 3).unwrap();
        // Leaves: b, y.outer.outer, y.outer.inner, y.inner, x, k
        let mapping = stage.leaf_mapping();
        assert_eq!(mapping.roots[1].coeffs, vec![0, 12, 4, 1, 0, 0]);
        // y.outer has extent 2, which 3 does not divide.
        assert_eq!(mapping.guards.len(), 1);
        assert_eq!(mapping.guards[0].1, 2);
    }

    #[test]
    fn test_split_nparts_sets_outer_extent() {
        let (mut s, c) = gemm_schedule();
        let stage = s.stage_mut(&c).unwrap();
        let y = stage.axis()[1];
        let (yo, yi) = stage.split_nparts(y, 2).unwrap();
        assert_eq!(stage.extent(yo), 2);
        assert_eq!(stage.extent(yi), 4);
    }

    #[test]
    fn test_foreign_iter_var_is_rejected() {
        let (ops, _) = batch_matmul(&[1, 2, 2, 2]).unwrap();
        let (ops2, bufs2) = batch_matmul(&[1, 2, 2, 2]).unwrap();
        let mut all = ops.clone();
        all.extend(ops2);
        let mut s = Schedule::create(&all);
        let foreign = s.stages()[0].axis()[0];
        let stage = s.stage_mut(&bufs2[2]).unwrap();
        assert!(matches!(
            stage.vectorize(foreign),
            Err(ScheduleError::ForeignIterVar { .. })
        ));
    }

    #[test]
    fn test_iter_var_of_another_schedule_is_rejected() {
        let (mut s, c) = gemm_schedule();
        let (other, other_c) = gemm_schedule();
        // Same stage index and node index, but a different schedule.
        let foreign = other.stage(&other_c).unwrap().axis()[1];
        let stage = s.stage_mut(&c).unwrap();
        assert_ne!(stage.axis()[1], foreign);
        assert!(matches!(
            stage.split(foreign, 2),
            Err(ScheduleError::ForeignIterVar { expected: 0, .. })
        ));
        assert!(matches!(
            stage.reorder(&[foreign]),
            Err(ScheduleError::ForeignIterVar { .. })
        ));
        assert_eq!(leaf_names(stage), vec!["b", "y", "x", "k"]);
    }

    #[test]
    #[should_panic(expected = "does not belong to stage")]
    fn test_extent_of_foreign_iter_var_panics() {
        let (s, c) = gemm_schedule();
        let (other, other_c) = gemm_schedule();
        let foreign = other.stage(&other_c).unwrap().axis()[0];
        s.stage(&c).unwrap().extent(foreign);
    }
}
