//! Schedule templates: schedules with tunable knobs.

use crate::schedule::{Schedule, ScheduleError};
use crate::space::{Config, SpaceError, SplitOptions};
use crate::tensor::{ComputeOp, Tensor};
use crate::workloads::{BATCH_MATMUL_ARGS, CONV2D_ARGS};

use std::sync::Arc;

/// A parameterized schedule.
///
/// Instantiating with [Config::Space] declares the knobs; instantiating with
/// [Config::Entity] builds the schedule for one configuration.
pub trait Template: Send + Sync {
    fn name(&self) -> &str;

    fn instantiate(&self, cfg: &mut Config) -> Result<(Schedule, Vec<Tensor>), TemplateError>;
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum TemplateError {
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Space(#[from] SpaceError),
    #[error("Template {template} expects {expected} buffers, got {got}")]
    BufferCount {
        template: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("Stage {stage} has {spatial} spatial and {reduce} reduction axes")]
    UnsupportedAxes {
        stage: String,
        spatial: usize,
        reduce: usize,
    },
}

/// Tiles the row, column and first reduction axis of a batched matmul.
///
/// The loop nest becomes `b, xo, yo, ko, xi, ki, yi` with `yi` vectorized.
pub struct GemmTemplate {
    ops: Vec<ComputeOp>,
    bufs: Vec<Tensor>,
}

/// The default schedule, without knobs.
pub struct ConvTemplate {
    ops: Vec<ComputeOp>,
    bufs: Vec<Tensor>,
}

impl GemmTemplate {
    pub fn new(ops: Vec<ComputeOp>, bufs: Vec<Tensor>) -> Self {
        GemmTemplate { ops, bufs }
    }
}

impl Template for GemmTemplate {
    fn name(&self) -> &str {
        "gemm"
    }

    fn instantiate(&self, cfg: &mut Config) -> Result<(Schedule, Vec<Tensor>), TemplateError> {
        if self.bufs.len() != 3 {
            return Err(TemplateError::BufferCount {
                template: "gemm",
                expected: 3,
                got: self.bufs.len(),
            });
        }
        let mut s = Schedule::create(&self.ops);
        let c = &self.bufs[2];
        let stage = s.stage_mut(c)?;

        let axes = stage.axis();
        let reduce_axes = stage.reduce_axis();
        let (y, x, k) = match (axes.as_slice(), reduce_axes.first()) {
            (&[_, y, x], Some(&k)) => (y, x, k),
            _ => {
                return Err(TemplateError::UnsupportedAxes {
                    stage: stage.op().name.clone(),
                    spatial: axes.len(),
                    reduce: reduce_axes.len(),
                })
            }
        };

        let two = SplitOptions::with_outputs(2);
        cfg.define_split("split_k", stage.extent(k), two)?;
        cfg.define_split("tile_y", stage.extent(y), two)?;
        cfg.define_split("tile_x", stage.extent(x), two)?;

        let (ko, ki) = pair(cfg.split("split_k")?.apply(stage, k)?);
        let (yo, yi) = pair(cfg.split("tile_y")?.apply(stage, y)?);
        let (xo, xi) = pair(cfg.split("tile_x")?.apply(stage, x)?);

        stage.reorder(&[xo, yo, ko, xi, ki, yi])?;
        stage.vectorize(yi)?;

        Ok((s, self.bufs.clone()))
    }
}

fn pair<T: Copy>(v: Vec<T>) -> (T, T) {
    debug_assert_eq!(v.len(), 2);
    (v[0], v[1])
}

impl ConvTemplate {
    pub fn new(ops: Vec<ComputeOp>, bufs: Vec<Tensor>) -> Self {
        ConvTemplate { ops, bufs }
    }
}

impl Template for ConvTemplate {
    fn name(&self) -> &str {
        "conv"
    }

    fn instantiate(&self, _cfg: &mut Config) -> Result<(Schedule, Vec<Tensor>), TemplateError> {
        Ok((Schedule::create(&self.ops), self.bufs.clone()))
    }
}

/// Picks a template by the number of arguments the computation was defined with.
pub fn select_template(
    ops: Vec<ComputeOp>,
    bufs: Vec<Tensor>,
    args: &[i64],
) -> Option<Arc<dyn Template>> {
    match args.len() {
        BATCH_MATMUL_ARGS => Some(Arc::new(GemmTemplate::new(ops, bufs))),
        CONV2D_ARGS => Some(Arc::new(ConvTemplate::new(ops, bufs))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::ConfigSpace;
    use crate::workloads::{batch_matmul, conv2d};

    fn leaf_names(s: &Schedule, t: &Tensor) -> Vec<String> {
        let stage = s.stage(t).unwrap();
        stage
            .leaf_iter_vars()
            .iter()
            .map(|&iv| stage.name(iv).to_owned())
            .collect()
    }

    #[test]
    fn test_gemm_template_defines_three_knobs() {
        let (ops, bufs) = batch_matmul(&[1, 8, 4, 6]).unwrap();
        let template = GemmTemplate::new(ops, bufs);
        let mut cfg = Config::Space(ConfigSpace::default());
        template.instantiate(&mut cfg).unwrap();
        let space = cfg.into_space().unwrap();
        let names = space.knobs().map(|(n, _)| n.to_owned()).collect::<Vec<_>>();
        assert_eq!(names, vec!["split_k", "tile_y", "tile_x"]);
        // 4 -> 3 candidates, 8 -> 4, 6 -> 4
        assert_eq!(space.len(), 48);
    }

    #[test]
    fn test_gemm_template_loop_order() {
        let (ops, bufs) = batch_matmul(&[1, 8, 4, 6]).unwrap();
        let template = GemmTemplate::new(ops, bufs.clone());
        let mut cfg = Config::Space(ConfigSpace::default());
        template.instantiate(&mut cfg).unwrap();
        let space = cfg.into_space().unwrap();

        let mut cfg = Config::Entity(space.get(7).unwrap());
        let (s, out_bufs) = template.instantiate(&mut cfg).unwrap();
        assert_eq!(out_bufs, bufs);
        assert_eq!(
            leaf_names(&s, &bufs[2]),
            vec!["b", "x.outer", "y.outer", "k.outer", "x.inner", "k.inner", "y.inner"]
        );
        let stage = s.stage(&bufs[2]).unwrap();
        let yi = *stage.leaf_iter_vars().last().unwrap();
        assert!(stage.is_vectorized(yi));
    }

    #[test]
    fn test_gemm_template_rejects_wrong_buffer_count() {
        let (ops, bufs) = batch_matmul(&[1, 2, 2, 2]).unwrap();
        let template = GemmTemplate::new(ops, bufs[..2].to_vec());
        let mut cfg = Config::Space(ConfigSpace::default());
        assert_eq!(
            template.instantiate(&mut cfg).unwrap_err(),
            TemplateError::BufferCount {
                template: "gemm",
                expected: 3,
                got: 2
            }
        );
    }

    #[test]
    fn test_gemm_template_rejects_conv_graph() {
        let (ops, bufs) = conv2d(&[1, 1, 4, 4, 1, 3, 3, 0, 0, 1, 1, 1, 1]).unwrap();
        let template = GemmTemplate::new(ops, bufs);
        let mut cfg = Config::Space(ConfigSpace::default());
        assert!(matches!(
            template.instantiate(&mut cfg),
            Err(TemplateError::UnsupportedAxes {
                spatial: 4,
                reduce: 3,
                ..
            })
        ));
    }

    #[test]
    fn test_conv_template_has_single_point_space() {
        let (ops, bufs) = conv2d(&[1, 1, 4, 4, 1, 3, 3, 0, 0, 1, 1, 1, 1]).unwrap();
        let template = ConvTemplate::new(ops, bufs);
        let mut cfg = Config::Space(ConfigSpace::default());
        template.instantiate(&mut cfg).unwrap();
        let space = cfg.into_space().unwrap();
        assert_eq!(space.len(), 1);
        assert!(space.get(0).unwrap().entities.is_empty());
    }

    #[test]
    fn test_select_template_by_arity() {
        let (ops, bufs) = batch_matmul(&[1, 2, 2, 2]).unwrap();
        let t = select_template(ops.clone(), bufs.clone(), &[1, 2, 2, 2]).unwrap();
        assert_eq!(t.name(), "gemm");
        let t = select_template(ops.clone(), bufs.clone(), &[0; 13]).unwrap();
        assert_eq!(t.name(), "conv");
        assert!(select_template(ops, bufs, &[1, 2]).is_none());
    }
}
