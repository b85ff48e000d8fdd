use crate::tensor::Tensor;
use std::fmt;
use std::ops::{Add, Mul, Sub};

/// An integer index expression over the axes of a [ComputeOp](crate::tensor::ComputeOp).
///
/// `Var(i)` refers to the op's `i`-th root axis, counting spatial axes first and
/// then reduction axes. Multiplication is only by constants, so every
/// [IndexExpr] is affine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexExpr {
    Var(usize),
    Const(i64),
    Add(Box<IndexExpr>, Box<IndexExpr>),
    Mul(Box<IndexExpr>, i64),
}

/// A scalar expression. Loads outside the bounds of their tensor read zero.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(f32),
    Load { tensor: Tensor, indices: Vec<IndexExpr> },
    Add(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
}

/// `offset + Σ coeffs[i] * vars[i]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Affine {
    pub coeffs: Vec<i64>,
    pub offset: i64,
}

impl IndexExpr {
    pub fn affine(&self, var_count: usize) -> Affine {
        match self {
            IndexExpr::Var(v) => {
                let mut a = Affine::zero(var_count);
                a.coeffs[*v] = 1;
                a
            }
            IndexExpr::Const(c) => Affine {
                coeffs: vec![0; var_count],
                offset: *c,
            },
            IndexExpr::Add(lhs, rhs) => lhs.affine(var_count).add(&rhs.affine(var_count)),
            IndexExpr::Mul(inner, c) => inner.affine(var_count).scale(*c),
        }
    }

    /// The largest variable index referenced, if any.
    pub fn max_var(&self) -> Option<usize> {
        match self {
            IndexExpr::Var(v) => Some(*v),
            IndexExpr::Const(_) => None,
            IndexExpr::Add(lhs, rhs) => lhs.max_var().max(rhs.max_var()),
            IndexExpr::Mul(inner, _) => inner.max_var(),
        }
    }
}

impl Add for IndexExpr {
    type Output = IndexExpr;

    fn add(self, rhs: IndexExpr) -> IndexExpr {
        IndexExpr::Add(Box::new(self), Box::new(rhs))
    }
}

impl Add<i64> for IndexExpr {
    type Output = IndexExpr;

    fn add(self, rhs: i64) -> IndexExpr {
        self + IndexExpr::Const(rhs)
    }
}

impl Sub<i64> for IndexExpr {
    type Output = IndexExpr;

    fn sub(self, rhs: i64) -> IndexExpr {
        self + IndexExpr::Const(-rhs)
    }
}

impl Mul<i64> for IndexExpr {
    type Output = IndexExpr;

    fn mul(self, rhs: i64) -> IndexExpr {
        IndexExpr::Mul(Box::new(self), rhs)
    }
}

impl Expr {
    /// Number of arithmetic operations performed per evaluation.
    pub fn op_count(&self) -> u64 {
        match self {
            Expr::Const(_) | Expr::Load { .. } => 0,
            Expr::Add(lhs, rhs) | Expr::Mul(lhs, rhs) => 1 + lhs.op_count() + rhs.op_count(),
        }
    }

    /// Calls `f` for every load in the expression, left to right.
    pub fn visit_loads<'a>(&'a self, f: &mut impl FnMut(&'a Tensor, &'a [IndexExpr])) {
        match self {
            Expr::Const(_) => {}
            Expr::Load { tensor, indices } => f(tensor, indices),
            Expr::Add(lhs, rhs) | Expr::Mul(lhs, rhs) => {
                lhs.visit_loads(f);
                rhs.visit_loads(f);
            }
        }
    }
}

impl Add for Expr {
    type Output = Expr;

    fn add(self, rhs: Expr) -> Expr {
        Expr::Add(Box::new(self), Box::new(rhs))
    }
}

impl Mul for Expr {
    type Output = Expr;

    fn mul(self, rhs: Expr) -> Expr {
        Expr::Mul(Box::new(self), Box::new(rhs))
    }
}

impl Affine {
    pub fn zero(var_count: usize) -> Self {
        Affine {
            coeffs: vec![0; var_count],
            offset: 0,
        }
    }

    pub fn add(&self, other: &Affine) -> Affine {
        debug_assert_eq!(self.coeffs.len(), other.coeffs.len());
        Affine {
            coeffs: self
                .coeffs
                .iter()
                .zip(&other.coeffs)
                .map(|(a, b)| a + b)
                .collect(),
            offset: self.offset + other.offset,
        }
    }

    pub fn scale(&self, c: i64) -> Affine {
        Affine {
            coeffs: self.coeffs.iter().map(|a| a * c).collect(),
            offset: self.offset * c,
        }
    }

    /// Substitutes each variable `i` with `vars[i]`, producing an [Affine] over
    /// the variables of `vars`.
    pub fn compose(&self, vars: &[Affine]) -> Affine {
        debug_assert_eq!(self.coeffs.len(), vars.len());
        let inner_count = vars.first().map(|v| v.coeffs.len()).unwrap_or(0);
        let mut result = Affine {
            coeffs: vec![0; inner_count],
            offset: self.offset,
        };
        for (c, v) in self.coeffs.iter().zip(vars) {
            if *c != 0 {
                result = result.add(&v.scale(*c));
            }
        }
        result
    }

    #[inline]
    pub fn eval(&self, values: &[i64]) -> i64 {
        self.coeffs
            .iter()
            .zip(values)
            .fold(self.offset, |acc, (c, v)| acc + c * v)
    }

    pub fn display<'a>(&'a self, names: &'a [String]) -> AffineDisplay<'a> {
        AffineDisplay(self, names)
    }
}

pub struct AffineDisplay<'a>(&'a Affine, &'a [String]);

impl fmt::Display for AffineDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let AffineDisplay(affine, names) = self;
        let mut wrote = false;
        for (c, name) in affine.coeffs.iter().zip(names.iter()) {
            match *c {
                0 => continue,
                1 => write!(f, "{}{}", if wrote { " + " } else { "" }, name)?,
                c => write!(f, "{}{}*{}", if wrote { " + " } else { "" }, name, c)?,
            }
            wrote = true;
        }
        if affine.offset != 0 || !wrote {
            if wrote {
                write!(f, " + {}", affine.offset)?;
            } else {
                write!(f, "{}", affine.offset)?;
            }
        }
        Ok(())
    }
}
