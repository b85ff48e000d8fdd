use crate::common::DimSize;
use crate::expr::{Affine, Expr};
use crate::schedule::Schedule;
use crate::tensor::{Tensor, TensorId};
use crate::utils::{indent, join_into_string};

use std::fmt;

/// A [Schedule] flattened into loop nests over numbered buffers.
///
/// Buffers `0..args.len()` are the caller's arguments; the rest are
/// intermediates which are only visible inside the function.
#[derive(Debug, Clone)]
pub struct LoweredFunc {
    pub name: String,
    pub args: Vec<Tensor>,
    pub temps: Vec<Tensor>,
    pub stages: Vec<LoweredStage>,
}

#[derive(Debug, Clone)]
pub struct LoweredStage {
    pub op_name: String,
    pub output: usize,
    pub loops: Vec<LoopVar>,
    /// Every guard must hold (`value < extent`) for the body to run.
    pub guards: Vec<(Affine, DimSize)>,
    pub store: Access,
    pub reduce: bool,
    pub body: LoweredExpr,
    /// Output axis names, used to print the initialization nest.
    init_axes: Vec<(String, DimSize)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopVar {
    pub name: String,
    pub extent: DimSize,
    pub vectorized: bool,
}

/// A buffer access whose per-dimension indices are affine in the leaf loops.
#[derive(Debug, Clone)]
pub struct Access {
    pub buffer: usize,
    pub indices: Vec<Affine>,
    pub shape: Vec<DimSize>,
    pub offset: Affine,
    /// False when the indices are provably in bounds for every iteration.
    pub checked: bool,
}

#[derive(Debug, Clone)]
pub enum LoweredExpr {
    Const(f32),
    Load(Access),
    Add(Box<LoweredExpr>, Box<LoweredExpr>),
    Mul(Box<LoweredExpr>, Box<LoweredExpr>),
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum LowerError {
    #[error("{op} reads {tensor}, which is neither an argument nor produced by an earlier stage")]
    UnboundTensor { op: String, tensor: String },
    #[error("{0} is produced by more than one stage")]
    MultipleProducers(String),
    #[error("{0} reads its own output")]
    ReadsOwnOutput(String),
}

/// Lowers `schedule` to a function taking `args` as its buffers.
pub fn lower(schedule: &Schedule, args: &[Tensor], name: &str) -> Result<LoweredFunc, LowerError> {
    let mut buffers: Vec<TensorId> = args.iter().map(|t| t.id()).collect();
    let mut temps = vec![];
    let mut produced: Vec<TensorId> = vec![];
    let mut stages = Vec::with_capacity(schedule.stages().len());

    for stage in schedule.stages() {
        let op = stage.op();
        let out_id = op.output.id();
        if produced.contains(&out_id) {
            return Err(LowerError::MultipleProducers(op.output.name().to_owned()));
        }

        let mapping = stage.leaf_mapping();
        let loops = stage
            .leaf_iter_vars()
            .iter()
            .map(|&iv| LoopVar {
                name: stage.name(iv).to_owned(),
                extent: stage.extent(iv),
                vectorized: stage.is_vectorized(iv),
            })
            .collect::<Vec<_>>();
        let extents = loops.iter().map(|l| l.extent).collect::<Vec<_>>();

        let body = lower_expr(&op.body, &mapping.roots, &extents, &|tensor: &Tensor| {
            if tensor.id() == out_id {
                return Err(LowerError::ReadsOwnOutput(op.name.clone()));
            }
            let unbound = || LowerError::UnboundTensor {
                op: op.name.clone(),
                tensor: tensor.name().to_owned(),
            };
            if !produced.contains(&tensor.id()) && !args.iter().any(|a| a.id() == tensor.id()) {
                return Err(unbound());
            }
            buffers
                .iter()
                .position(|b| *b == tensor.id())
                .ok_or_else(unbound)
        })?;

        let output = match buffers.iter().position(|b| *b == out_id) {
            Some(idx) => idx,
            None => {
                buffers.push(out_id);
                temps.push(op.output.clone());
                buffers.len() - 1
            }
        };
        let store_indices = mapping.roots[..op.axis.len()].to_vec();
        let store = make_access(output, &op.output, store_indices, &extents);
        produced.push(out_id);

        stages.push(LoweredStage {
            op_name: op.name.clone(),
            output,
            loops,
            guards: mapping.guards,
            store,
            reduce: !op.reduce_axis.is_empty(),
            body,
            init_axes: op
                .axis
                .iter()
                .map(|a| (a.name.clone(), a.extent))
                .collect(),
        });
    }

    Ok(LoweredFunc {
        name: name.to_owned(),
        args: args.to_vec(),
        temps,
        stages,
    })
}

fn lower_expr(
    expr: &Expr,
    roots: &[Affine],
    extents: &[DimSize],
    resolve: &dyn Fn(&Tensor) -> Result<usize, LowerError>,
) -> Result<LoweredExpr, LowerError> {
    Ok(match expr {
        Expr::Const(c) => LoweredExpr::Const(*c),
        Expr::Load { tensor, indices } => {
            let buffer = resolve(tensor)?;
            let leaf_indices = indices
                .iter()
                .map(|i| i.affine(roots.len()).compose(roots))
                .collect();
            LoweredExpr::Load(make_access(buffer, tensor, leaf_indices, extents))
        }
        Expr::Add(lhs, rhs) => LoweredExpr::Add(
            Box::new(lower_expr(lhs, roots, extents, resolve)?),
            Box::new(lower_expr(rhs, roots, extents, resolve)?),
        ),
        Expr::Mul(lhs, rhs) => LoweredExpr::Mul(
            Box::new(lower_expr(lhs, roots, extents, resolve)?),
            Box::new(lower_expr(rhs, roots, extents, resolve)?),
        ),
    })
}

fn make_access(buffer: usize, tensor: &Tensor, indices: Vec<Affine>, extents: &[DimSize]) -> Access {
    let strides = tensor.strides();
    let offset = indices
        .iter()
        .zip(&strides)
        .fold(Affine::zero(extents.len()), |acc, (idx, s)| {
            acc.add(&idx.scale(*s))
        });
    let checked = indices
        .iter()
        .zip(tensor.shape())
        .any(|(idx, &dim)| !statically_in_bounds(idx, extents, dim));
    Access {
        buffer,
        indices,
        shape: tensor.shape().to_vec(),
        offset,
        checked,
    }
}

/// True if `0 <= idx < dim` for every leaf value in range.
fn statically_in_bounds(idx: &Affine, extents: &[DimSize], dim: DimSize) -> bool {
    let (mut lo, mut hi) = (idx.offset, idx.offset);
    for (c, &e) in idx.coeffs.iter().zip(extents) {
        let span = c * (i64::from(e) - 1);
        if span < 0 {
            lo += span;
        } else {
            hi += span;
        }
    }
    lo >= 0 && hi < i64::from(dim)
}

impl LoweredFunc {
    pub fn buffer_count(&self) -> usize {
        self.args.len() + self.temps.len()
    }

    pub fn buffer(&self, idx: usize) -> &Tensor {
        if idx < self.args.len() {
            &self.args[idx]
        } else {
            &self.temps[idx - self.args.len()]
        }
    }
}

impl fmt::Display for LoweredFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "func {}({}) {{", self.name, join_into_string(&self.args, ", "))?;
        for t in &self.temps {
            writeln!(f, "{}alloc {}", indent(1), t)?;
        }
        for stage in &self.stages {
            let out_name = self.buffer(stage.output).name();
            if stage.reduce {
                for (depth, (name, extent)) in stage.init_axes.iter().enumerate() {
                    writeln!(f, "{}for ({}, 0, {}) {{", indent(depth + 1), name, extent)?;
                }
                let names = stage
                    .init_axes
                    .iter()
                    .map(|(n, _)| n.as_str())
                    .collect::<Vec<_>>();
                writeln!(
                    f,
                    "{}{}[{}] = 0",
                    indent(stage.init_axes.len() + 1),
                    out_name,
                    names.join(", ")
                )?;
                for depth in (0..stage.init_axes.len()).rev() {
                    writeln!(f, "{}}}", indent(depth + 1))?;
                }
            }

            let names = stage.loops.iter().map(|l| l.name.clone()).collect::<Vec<_>>();
            for (depth, l) in stage.loops.iter().enumerate() {
                writeln!(
                    f,
                    "{}{}for ({}, 0, {}) {{",
                    indent(depth + 1),
                    if l.vectorized { "vectorized " } else { "" },
                    l.name,
                    l.extent
                )?;
            }
            let mut depth = stage.loops.len() + 1;
            if !stage.guards.is_empty() {
                let cond = stage
                    .guards
                    .iter()
                    .map(|(a, e)| format!("{} < {}", a.display(&names), e))
                    .collect::<Vec<_>>()
                    .join(" && ");
                writeln!(f, "{}if ({}) {{", indent(depth), cond)?;
                depth += 1;
            }
            writeln!(
                f,
                "{}{} {} {}",
                indent(depth),
                AccessDisplay(self, &stage.store, &names),
                if stage.reduce { "+=" } else { "=" },
                ExprDisplay(self, &stage.body, &names)
            )?;
            if !stage.guards.is_empty() {
                depth -= 1;
                writeln!(f, "{}}}", indent(depth))?;
            }
            for depth in (0..stage.loops.len()).rev() {
                writeln!(f, "{}}}", indent(depth + 1))?;
            }
        }
        write!(f, "}}")
    }
}

struct AccessDisplay<'a>(&'a LoweredFunc, &'a Access, &'a [String]);

impl fmt::Display for AccessDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let AccessDisplay(func, access, names) = self;
        write!(
            f,
            "{}[{}]",
            func.buffer(access.buffer).name(),
            join_into_string(access.indices.iter().map(|i| i.display(names)), ", ")
        )
    }
}

struct ExprDisplay<'a>(&'a LoweredFunc, &'a LoweredExpr, &'a [String]);

impl fmt::Display for ExprDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ExprDisplay(func, expr, names) = self;
        match expr {
            LoweredExpr::Const(c) => write!(f, "{c}"),
            LoweredExpr::Load(access) => write!(f, "{}", AccessDisplay(func, access, names)),
            LoweredExpr::Add(lhs, rhs) => write!(
                f,
                "({} + {})",
                ExprDisplay(func, lhs, names),
                ExprDisplay(func, rhs, names)
            ),
            LoweredExpr::Mul(lhs, rhs) => write!(
                f,
                "{} * {}",
                ExprDisplay(func, lhs, names),
                ExprDisplay(func, rhs, names)
            ),
        }
    }
}
