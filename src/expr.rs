//! The restricted expression language used by deterministic nodes,
//! stochastic-node parameters and alternate parameterizations.
//!
//! Expressions are generic over the reference type. A front-end produces
//! `Expr<String>`; model building resolves the names and produces
//! `Expr<NodeId>`, which is what the run stage evaluates.

use std::{
    borrow::Cow,
    fmt::{self, Display},
    ops::{Add, Div, Mul, Neg, Sub},
    str::FromStr,
};

use thiserror::Error;

use crate::math::{expit, ln_gamma, logit, vector_dot};
use crate::shape::Shape;

/// The fixed set of numeric kernels an expression may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    Exp,
    Log,
    Sqrt,
    Abs,
    Logit,
    Expit,
    Lgamma,
    Sum,
    Mean,
    Inprod,
    Min,
    Max,
}

impl Kernel {
    pub fn arity(&self) -> usize {
        match self {
            Kernel::Inprod | Kernel::Min | Kernel::Max => 2,
            _ => 1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Kernel::Exp => "exp",
            Kernel::Log => "log",
            Kernel::Sqrt => "sqrt",
            Kernel::Abs => "abs",
            Kernel::Logit => "logit",
            Kernel::Expit => "expit",
            Kernel::Lgamma => "lgamma",
            Kernel::Sum => "sum",
            Kernel::Mean => "mean",
            Kernel::Inprod => "inprod",
            Kernel::Min => "min",
            Kernel::Max => "max",
        }
    }

    fn apply_unary(&self, x: f64) -> f64 {
        match self {
            Kernel::Exp => x.exp(),
            Kernel::Log => x.ln(),
            Kernel::Sqrt => x.sqrt(),
            Kernel::Abs => x.abs(),
            Kernel::Logit => logit(x),
            Kernel::Expit => expit(x),
            Kernel::Lgamma => ln_gamma(x),
            _ => unreachable!("not an element-wise unary kernel"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown kernel '{0}'")]
pub struct UnknownKernel(pub String);

impl FromStr for Kernel {
    type Err = UnknownKernel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "exp" => Kernel::Exp,
            "log" => Kernel::Log,
            "sqrt" => Kernel::Sqrt,
            "abs" => Kernel::Abs,
            "logit" => Kernel::Logit,
            "expit" | "ilogit" => Kernel::Expit,
            "lgamma" => Kernel::Lgamma,
            "sum" => Kernel::Sum,
            "mean" => Kernel::Mean,
            "inprod" => Kernel::Inprod,
            "min" | "pmin" => Kernel::Min,
            "max" | "pmax" => Kernel::Max,
            other => return Err(UnknownKernel(other.to_string())),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    #[inline]
    fn apply(&self, a: f64, b: f64) -> f64 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Pow => a.powf(b),
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Pow => "^",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr<R> {
    Const(f64),
    Vector(Vec<f64>),
    Ref(R),
    /// Element of a referenced array. Indices are zero-based constants.
    Index(R, Vec<usize>),
    Neg(Box<Expr<R>>),
    Binary(BinaryOp, Box<Expr<R>>, Box<Expr<R>>),
    Call(Kernel, Vec<Expr<R>>),
}

/// Reference to a named node.
pub fn node(name: &str) -> Expr<String> {
    Expr::Ref(name.to_string())
}

/// Constant-indexed element of a named node.
pub fn elem(name: &str, index: impl Into<Vec<usize>>) -> Expr<String> {
    Expr::Index(name.to_string(), index.into())
}

pub fn constant<R>(value: f64) -> Expr<R> {
    Expr::Const(value)
}

pub fn call<R>(kernel: Kernel, args: impl Into<Vec<Expr<R>>>) -> Expr<R> {
    Expr::Call(kernel, args.into())
}

impl<R> From<f64> for Expr<R> {
    fn from(value: f64) -> Self {
        Expr::Const(value)
    }
}

impl<R> From<Vec<f64>> for Expr<R> {
    fn from(value: Vec<f64>) -> Self {
        Expr::Vector(value)
    }
}

impl<R> Expr<R> {
    pub fn exp(self) -> Self {
        Expr::Call(Kernel::Exp, vec![self])
    }

    pub fn ln(self) -> Self {
        Expr::Call(Kernel::Log, vec![self])
    }

    pub fn sqrt(self) -> Self {
        Expr::Call(Kernel::Sqrt, vec![self])
    }

    pub fn expit(self) -> Self {
        Expr::Call(Kernel::Expit, vec![self])
    }

    pub fn pow(self, exponent: impl Into<Expr<R>>) -> Self {
        Expr::Binary(BinaryOp::Pow, Box::new(self), Box::new(exponent.into()))
    }

    fn binary(op: BinaryOp, lhs: Self, rhs: Self) -> Self {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    /// The constant value of this expression if it does not reference any
    /// node and evaluates to a scalar.
    pub fn as_const(&self) -> Option<f64> {
        match self {
            Expr::Const(v) => Some(*v),
            _ => None,
        }
    }

    /// References in order of first use, without duplicates.
    pub fn refs(&self) -> Vec<&R>
    where
        R: PartialEq,
    {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a R>)
    where
        R: PartialEq,
    {
        match self {
            Expr::Const(_) | Expr::Vector(_) => {}
            Expr::Ref(r) | Expr::Index(r, _) => {
                if !out.contains(&r) {
                    out.push(r);
                }
            }
            Expr::Neg(inner) => inner.collect_refs(out),
            Expr::Binary(_, lhs, rhs) => {
                lhs.collect_refs(out);
                rhs.collect_refs(out);
            }
            Expr::Call(_, args) => args.iter().for_each(|arg| arg.collect_refs(out)),
        }
    }

    /// Translate every reference, failing on the first error.
    pub fn try_map_refs<S, E>(&self, f: &mut impl FnMut(&R) -> Result<S, E>) -> Result<Expr<S>, E> {
        Ok(match self {
            Expr::Const(v) => Expr::Const(*v),
            Expr::Vector(v) => Expr::Vector(v.clone()),
            Expr::Ref(r) => Expr::Ref(f(r)?),
            Expr::Index(r, idx) => Expr::Index(f(r)?, idx.clone()),
            Expr::Neg(inner) => Expr::Neg(Box::new(inner.try_map_refs(f)?)),
            Expr::Binary(op, lhs, rhs) => Expr::Binary(
                *op,
                Box::new(lhs.try_map_refs(f)?),
                Box::new(rhs.try_map_refs(f)?),
            ),
            Expr::Call(kernel, args) => Expr::Call(
                *kernel,
                args.iter()
                    .map(|arg| arg.try_map_refs(f))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }

    /// Replace every reference by another expression.
    ///
    /// An indexed reference can only be replaced by a plain reference or a
    /// constant vector; anything else yields `None`.
    pub fn substitute<S: Clone>(&self, lookup: &impl Fn(&R) -> Option<Expr<S>>) -> Option<Expr<S>> {
        Some(match self {
            Expr::Const(v) => Expr::Const(*v),
            Expr::Vector(v) => Expr::Vector(v.clone()),
            Expr::Ref(r) => lookup(r)?,
            Expr::Index(r, idx) => match lookup(r)? {
                Expr::Ref(s) => Expr::Index(s, idx.clone()),
                Expr::Vector(v) if idx.len() == 1 => Expr::Const(*v.get(idx[0])?),
                _ => return None,
            },
            Expr::Neg(inner) => Expr::Neg(Box::new(inner.substitute(lookup)?)),
            Expr::Binary(op, lhs, rhs) => Expr::Binary(
                *op,
                Box::new(lhs.substitute(lookup)?),
                Box::new(rhs.substitute(lookup)?),
            ),
            Expr::Call(kernel, args) => Expr::Call(
                *kernel,
                args.iter()
                    .map(|arg| arg.substitute(lookup))
                    .collect::<Option<_>>()?,
            ),
        })
    }

    /// Fold constant subexpressions.
    pub fn simplify(self) -> Self {
        match self {
            Expr::Neg(inner) => match inner.simplify() {
                Expr::Const(v) => Expr::Const(-v),
                other => Expr::Neg(Box::new(other)),
            },
            Expr::Binary(op, lhs, rhs) => match (lhs.simplify(), rhs.simplify()) {
                (Expr::Const(a), Expr::Const(b)) => Expr::Const(op.apply(a, b)),
                (a, b) => Expr::binary(op, a, b),
            },
            Expr::Call(kernel, args) => {
                let args: Vec<_> = args.into_iter().map(Expr::simplify).collect();
                if let (1, [Expr::Const(v)]) = (kernel.arity(), args.as_slice()) {
                    let v = *v;
                    return match kernel {
                        Kernel::Sum | Kernel::Mean => Expr::Const(v),
                        _ => Expr::Const(kernel.apply_unary(v)),
                    };
                }
                Expr::Call(kernel, args)
            }
            other => other,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExprError {
    #[error("cannot combine shapes {lhs} and {rhs} element-wise")]
    Broadcast { lhs: Shape, rhs: Shape },
    #[error("index {index:?} does not address an element of shape {shape}")]
    BadIndex { index: Vec<usize>, shape: Shape },
    #[error("kernel '{kernel}' expects {expected} arguments, got {actual}")]
    Arity {
        kernel: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("empty constant vector")]
    EmptyVector,
}

fn broadcast(lhs: Shape, rhs: Shape) -> Result<Shape, ExprError> {
    if lhs.is_scalar() {
        Ok(rhs)
    } else if rhs.is_scalar() || lhs == rhs {
        Ok(lhs)
    } else {
        Err(ExprError::Broadcast { lhs, rhs })
    }
}

impl<R> Expr<R> {
    /// Shape of the value this expression evaluates to.
    pub fn infer_shape(&self, shape_of: &impl Fn(&R) -> Shape) -> Result<Shape, ExprError> {
        match self {
            Expr::Const(_) => Ok(Shape::scalar()),
            Expr::Vector(v) if v.is_empty() => Err(ExprError::EmptyVector),
            Expr::Vector(v) => Ok(Shape::vector(v.len())),
            Expr::Ref(r) => Ok(shape_of(r)),
            Expr::Index(r, index) => {
                let shape = shape_of(r);
                match shape.flat_index(index) {
                    Some(_) => Ok(Shape::scalar()),
                    None => Err(ExprError::BadIndex {
                        index: index.clone(),
                        shape,
                    }),
                }
            }
            Expr::Neg(inner) => inner.infer_shape(shape_of),
            Expr::Binary(_, lhs, rhs) => {
                broadcast(lhs.infer_shape(shape_of)?, rhs.infer_shape(shape_of)?)
            }
            Expr::Call(kernel, args) => {
                if args.len() != kernel.arity() {
                    return Err(ExprError::Arity {
                        kernel: kernel.name(),
                        expected: kernel.arity(),
                        actual: args.len(),
                    });
                }
                match kernel {
                    Kernel::Sum | Kernel::Mean => {
                        args[0].infer_shape(shape_of)?;
                        Ok(Shape::scalar())
                    }
                    Kernel::Inprod => {
                        let lhs = args[0].infer_shape(shape_of)?;
                        let rhs = args[1].infer_shape(shape_of)?;
                        if lhs != rhs {
                            return Err(ExprError::Broadcast { lhs, rhs });
                        }
                        Ok(Shape::scalar())
                    }
                    Kernel::Min | Kernel::Max => {
                        broadcast(args[0].infer_shape(shape_of)?, args[1].infer_shape(shape_of)?)
                    }
                    _ => args[0].infer_shape(shape_of),
                }
            }
        }
    }
}

/// Read access to the current values of referenced nodes.
pub trait Env<R> {
    fn value(&self, r: &R) -> &[f64];
    fn shape(&self, r: &R) -> &Shape;
}

/// Intermediate result of evaluation. Scalars never allocate.
#[derive(Debug)]
enum Evaluated<'a> {
    Scalar(f64),
    Array(Cow<'a, [f64]>),
}

impl Evaluated<'_> {
    fn get(&self, i: usize) -> f64 {
        match self {
            Evaluated::Scalar(v) => *v,
            Evaluated::Array(a) if a.len() == 1 => a[0],
            Evaluated::Array(a) => a[i],
        }
    }

    fn len(&self) -> usize {
        match self {
            Evaluated::Scalar(_) => 1,
            Evaluated::Array(a) => a.len(),
        }
    }

    fn map(self, f: impl Fn(f64) -> f64) -> Evaluated<'static> {
        match self {
            Evaluated::Scalar(v) => Evaluated::Scalar(f(v)),
            Evaluated::Array(a) => Evaluated::Array(Cow::Owned(a.iter().map(|&v| f(v)).collect())),
        }
    }

    fn zip(self, other: Evaluated<'_>, f: impl Fn(f64, f64) -> f64) -> Evaluated<'static> {
        match (&self, &other) {
            (Evaluated::Scalar(a), Evaluated::Scalar(b)) => Evaluated::Scalar(f(*a, *b)),
            _ => {
                let len = self.len().max(other.len());
                Evaluated::Array(Cow::Owned(
                    (0..len).map(|i| f(self.get(i), other.get(i))).collect(),
                ))
            }
        }
    }

    fn sum(&self) -> f64 {
        match self {
            Evaluated::Scalar(v) => *v,
            Evaluated::Array(a) => a.iter().sum(),
        }
    }
}

impl<R> Expr<R> {
    fn eval_inner<'a>(&self, env: &'a impl Env<R>) -> Evaluated<'a> {
        match self {
            Expr::Const(v) => Evaluated::Scalar(*v),
            Expr::Vector(v) => Evaluated::Array(Cow::Owned(v.clone())),
            Expr::Ref(r) => Evaluated::Array(Cow::Borrowed(env.value(r))),
            Expr::Index(r, index) => {
                let offset = env
                    .shape(r)
                    .flat_index(index)
                    .expect("Index validated at build time");
                Evaluated::Scalar(env.value(r)[offset])
            }
            Expr::Neg(inner) => inner.eval_inner(env).map(|v| -v),
            Expr::Binary(op, lhs, rhs) => lhs
                .eval_inner(env)
                .zip(rhs.eval_inner(env), |a, b| op.apply(a, b)),
            Expr::Call(kernel, args) => match kernel {
                Kernel::Sum => Evaluated::Scalar(args[0].eval_inner(env).sum()),
                Kernel::Mean => {
                    let value = args[0].eval_inner(env);
                    Evaluated::Scalar(value.sum() / value.len() as f64)
                }
                Kernel::Inprod => {
                    let lhs = args[0].eval_inner(env);
                    let rhs = args[1].eval_inner(env);
                    match (&lhs, &rhs) {
                        (Evaluated::Array(a), Evaluated::Array(b)) => {
                            Evaluated::Scalar(vector_dot(a, b))
                        }
                        _ => Evaluated::Scalar(lhs.get(0) * rhs.get(0)),
                    }
                }
                Kernel::Min => args[0].eval_inner(env).zip(args[1].eval_inner(env), f64::min),
                Kernel::Max => args[0].eval_inner(env).zip(args[1].eval_inner(env), f64::max),
                unary => args[0].eval_inner(env).map(|v| unary.apply_unary(v)),
            },
        }
    }

    /// Evaluate into `out`, broadcasting a scalar result over every element.
    pub fn eval_into(&self, env: &impl Env<R>, out: &mut [f64]) {
        match self.eval_inner(env) {
            Evaluated::Scalar(v) => out.fill(v),
            Evaluated::Array(a) if a.len() == 1 => out.fill(a[0]),
            Evaluated::Array(a) => out.copy_from_slice(&a),
        }
    }

    /// Evaluate an expression known to be scalar.
    pub fn eval_scalar(&self, env: &impl Env<R>) -> f64 {
        self.eval_inner(env).get(0)
    }

    pub fn eval_vec(&self, env: &impl Env<R>) -> Vec<f64> {
        match self.eval_inner(env) {
            Evaluated::Scalar(v) => vec![v],
            Evaluated::Array(a) => a.into_owned(),
        }
    }
}

/// An environment without any references, for constant expressions.
pub struct NoRefs;

impl<R> Env<R> for NoRefs {
    fn value(&self, _r: &R) -> &[f64] {
        unreachable!("constant expression has no references")
    }

    fn shape(&self, _r: &R) -> &Shape {
        unreachable!("constant expression has no references")
    }
}

macro_rules! impl_binop {
    ($trait:ident, $method:ident, $op:expr) => {
        impl<R> $trait for Expr<R> {
            type Output = Expr<R>;

            fn $method(self, rhs: Expr<R>) -> Expr<R> {
                Expr::binary($op, self, rhs)
            }
        }

        impl<R> $trait<f64> for Expr<R> {
            type Output = Expr<R>;

            fn $method(self, rhs: f64) -> Expr<R> {
                Expr::binary($op, self, Expr::Const(rhs))
            }
        }

        impl<R> $trait<Expr<R>> for f64 {
            type Output = Expr<R>;

            fn $method(self, rhs: Expr<R>) -> Expr<R> {
                Expr::binary($op, Expr::Const(self), rhs)
            }
        }
    };
}

impl_binop!(Add, add, BinaryOp::Add);
impl_binop!(Sub, sub, BinaryOp::Sub);
impl_binop!(Mul, mul, BinaryOp::Mul);
impl_binop!(Div, div, BinaryOp::Div);

impl<R> Neg for Expr<R> {
    type Output = Expr<R>;

    fn neg(self) -> Expr<R> {
        Expr::Neg(Box::new(self))
    }
}

impl<R: Display> Display for Expr<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(v) => write!(f, "{}", v),
            Expr::Vector(v) => write!(f, "{:?}", v),
            Expr::Ref(r) => write!(f, "{}", r),
            Expr::Index(r, idx) => write!(f, "{}{:?}", r, idx),
            Expr::Neg(inner) => write!(f, "-({})", inner),
            Expr::Binary(op, lhs, rhs) => write!(f, "({} {} {})", lhs, op.symbol(), rhs),
            Expr::Call(kernel, args) => {
                write!(f, "{}(", kernel.name())?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
        }
    }
}
