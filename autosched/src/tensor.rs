use crate::common::{volume, DimSize, Dtype, Shape};
use crate::expr::{Expr, IndexExpr};
use crate::utils::join_into_string;

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_TENSOR_ID: AtomicU32 = AtomicU32::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(u32);

/// A named, shaped buffer. Identity is by [TensorId], unique within the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tensor {
    id: TensorId,
    name: String,
    shape: Shape,
    dtype: Dtype,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IterVarKind {
    Spatial,
    Reduce,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisDef {
    pub name: String,
    pub extent: DimSize,
}

/// A compute stage producing one output [Tensor].
///
/// Without reduction axes, `output[axis...] = body`. With reduction axes, the
/// output is the sum of `body` over the whole reduction domain.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeOp {
    pub name: String,
    pub output: Tensor,
    pub axis: Vec<AxisDef>,
    pub reduce_axis: Vec<AxisDef>,
    pub body: Expr,
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum DefinitionError {
    #[error("Expected {expected} arguments, got {got}")]
    ArgumentCount { expected: usize, got: usize },
    #[error("Argument `{name}` has invalid value {value}")]
    InvalidArgument { name: &'static str, value: i64 },
    #[error("Tensor {0} has a zero-sized dimension")]
    EmptyTensor(String),
    #[error("Load of {tensor} uses {got} indices but the tensor has rank {expected}")]
    RankMismatch {
        tensor: String,
        expected: usize,
        got: usize,
    },
    #[error("Body of {op} refers to axis {axis}, but the op has {count} axes")]
    UnboundAxis {
        op: String,
        axis: usize,
        count: usize,
    },
    #[error("Expected {expected} axis names, got {got}")]
    AxisNameCount { expected: usize, got: usize },
}

impl Tensor {
    pub fn placeholder(name: &str, shape: &[DimSize]) -> Result<Self, DefinitionError> {
        if shape.iter().any(|&d| d == 0) {
            return Err(DefinitionError::EmptyTensor(name.to_owned()));
        }
        Ok(Tensor {
            id: TensorId(NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.to_owned(),
            shape: Shape::from_slice(shape),
            dtype: Dtype::Float32,
        })
    }

    pub fn id(&self) -> TensorId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[DimSize] {
        &self.shape
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn volume(&self) -> usize {
        volume(&self.shape)
    }

    /// Row-major strides, in elements.
    pub fn strides(&self) -> Vec<i64> {
        let mut strides = vec![1i64; self.shape.len()];
        for i in (0..self.shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * i64::from(self.shape[i + 1]);
        }
        strides
    }

    /// Builds a load of this tensor.
    pub fn at(&self, indices: impl IntoIterator<Item = IndexExpr>) -> Expr {
        Expr::Load {
            tensor: self.clone(),
            indices: indices.into_iter().collect(),
        }
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}[{}]",
            self.name,
            self.dtype,
            join_into_string(self.shape.iter(), ", ")
        )
    }
}

impl ComputeOp {
    /// Defines a new compute stage.
    ///
    /// `body` receives index expressions for the spatial axes and for the
    /// reduction axes, in that order.
    pub fn compute(
        name: &str,
        shape: &[DimSize],
        axis_names: &[&str],
        reduce: &[(&str, DimSize)],
        body: impl FnOnce(&[IndexExpr], &[IndexExpr]) -> Expr,
    ) -> Result<Self, DefinitionError> {
        if axis_names.len() != shape.len() {
            return Err(DefinitionError::AxisNameCount {
                expected: shape.len(),
                got: axis_names.len(),
            });
        }
        if reduce.iter().any(|(_, e)| *e == 0) {
            return Err(DefinitionError::EmptyTensor(name.to_owned()));
        }
        let output = Tensor::placeholder(name, shape)?;
        let axis = axis_names
            .iter()
            .zip(shape)
            .map(|(n, &extent)| AxisDef {
                name: (*n).to_owned(),
                extent,
            })
            .collect::<Vec<_>>();
        let reduce_axis = reduce
            .iter()
            .map(|&(n, extent)| AxisDef {
                name: n.to_owned(),
                extent,
            })
            .collect::<Vec<_>>();

        let spatial_vars = (0..axis.len()).map(IndexExpr::Var).collect::<Vec<_>>();
        let reduce_vars = (axis.len()..axis.len() + reduce_axis.len())
            .map(IndexExpr::Var)
            .collect::<Vec<_>>();
        let op = ComputeOp {
            name: name.to_owned(),
            output,
            axis,
            reduce_axis,
            body: body(&spatial_vars, &reduce_vars),
        };
        op.validate()?;
        Ok(op)
    }

    fn validate(&self) -> Result<(), DefinitionError> {
        let count = self.root_count();
        let mut result = Ok(());
        self.body.visit_loads(&mut |tensor, indices| {
            if result.is_err() {
                return;
            }
            if indices.len() != tensor.shape().len() {
                result = Err(DefinitionError::RankMismatch {
                    tensor: tensor.name().to_owned(),
                    expected: tensor.shape().len(),
                    got: indices.len(),
                });
                return;
            }
            if let Some(axis) = indices.iter().filter_map(|i| i.max_var()).max() {
                if axis >= count {
                    result = Err(DefinitionError::UnboundAxis {
                        op: self.name.clone(),
                        axis,
                        count,
                    });
                }
            }
        });
        result
    }

    /// Number of root axes: spatial axes followed by reduction axes.
    pub fn root_count(&self) -> usize {
        self.axis.len() + self.reduce_axis.len()
    }

    pub fn root_axes(&self) -> impl Iterator<Item = (&AxisDef, IterVarKind)> {
        self.axis
            .iter()
            .map(|a| (a, IterVarKind::Spatial))
            .chain(self.reduce_axis.iter().map(|a| (a, IterVarKind::Reduce)))
    }

    /// Tensors read by this op, deduplicated, in order of first use.
    pub fn inputs(&self) -> Vec<Tensor> {
        let mut result: Vec<Tensor> = vec![];
        self.body.visit_loads(&mut |tensor, _| {
            if !result.iter().any(|t| t.id() == tensor.id()) {
                result.push(tensor.clone());
            }
        });
        result
    }

    /// Floating-point operations performed by one evaluation of the op.
    pub fn flop(&self) -> f64 {
        let domain = self
            .root_axes()
            .map(|(a, _)| f64::from(a.extent))
            .product::<f64>();
        let per_point = self.body.op_count() + u64::from(!self.reduce_axis.is_empty());
        domain * per_point as f64
    }
}
