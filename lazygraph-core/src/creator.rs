//! Graph construction helpers. Nothing here computes: every creator returns
//! a handle to a new leaf or operator node.

use std::ops::{Add, Div, Mul, Neg, Sub};

use ::rand::{rngs::StdRng, SeedableRng};

use crate::{
    dtype::vec_to_bytes,
    op::{BinaryOpType, ReduceType, UnaryOpType},
    storage::SharedBuffer,
    DType, Descriptor, ElementType, Error, Expr, LeafData, Layout, Op, Result, Var, VarKind,
};

fn leaf(desc: Descriptor, data: LeafData<'_>, kind: VarKind) -> Result<Var> {
    Ok(Var::new(Expr::create_leaf(desc, data, kind, "")?, 0))
}

fn checked_desc(dims: &[i32], len: usize, dtype: ElementType) -> Result<Descriptor> {
    let desc = Descriptor::of(dims, dtype);
    if desc.size != len {
        return Err(Error::msg(format!(
            "{len} values do not fill dims {dims:?} ({} elements)",
            desc.size
        )));
    }
    Ok(desc)
}

/// An input placeholder. Extents may be `-1` until the input is resized;
/// content must be written before it is read.
pub fn input(dims: &[i32], dtype: ElementType) -> Result<Var> {
    input_with_layout(dims, Layout::default(), dtype)
}

pub fn input_with_layout(dims: &[i32], layout: Layout, dtype: ElementType) -> Result<Var> {
    leaf(
        Descriptor::new(dims.to_vec(), layout, dtype),
        LeafData::None,
        VarKind::Input,
    )
}

/// A constant holding a copy of `values`.
pub fn constant<T: DType>(values: &[T], dims: &[i32]) -> Result<Var> {
    let desc = checked_desc(dims, values.len(), T::ELEMENT)?;
    let bytes = vec_to_bytes(values);
    leaf(desc, LeafData::Copy(&bytes), VarKind::Constant)
}

/// A constant reading `buffer` in place. Writes through the buffer are seen
/// by the graph once the constant's consumers are informed.
pub fn constant_shared(buffer: SharedBuffer, dims: &[i32], dtype: ElementType) -> Result<Var> {
    leaf(
        Descriptor::of(dims, dtype),
        LeafData::Adopt(buffer),
        VarKind::Constant,
    )
}

pub fn scalar<T: DType>(value: T) -> Result<Var> {
    constant(&[value], &[])
}

pub fn trainable_param<T: DType>(values: &[T], dims: &[i32]) -> Result<Var> {
    let desc = checked_desc(dims, values.len(), T::ELEMENT)?;
    let bytes = vec_to_bytes(values);
    leaf(desc, LeafData::Copy(&bytes), VarKind::Trainable)
}

/// Constant filled from U(low, high). Integral types are floored.
pub fn uniform<T: DType>(dims: &[i32], low: f64, high: f64, seed: u64) -> Result<Var> {
    let desc = Descriptor::of(dims, T::ELEMENT);
    let mut values = vec![T::ZERO; desc.size];
    let mut rng = StdRng::seed_from_u64(seed);
    T::fill_with_uniform(&mut rng, &mut values, low, high)?;
    constant(&values, dims)
}

/// Constant filled from N(mean, std). Float types only.
pub fn normal<T: DType>(dims: &[i32], mean: f64, std: f64, seed: u64) -> Result<Var> {
    let desc = Descriptor::of(dims, T::ELEMENT);
    let mut values = vec![T::ZERO; desc.size];
    let mut rng = StdRng::seed_from_u64(seed);
    T::fill_with_normal(&mut rng, &mut values, mean, std)?;
    constant(&values, dims)
}

fn op1(op: Op, inputs: Vec<Var>) -> Var {
    Var::new(Expr::create_op(op, inputs, ""), 0)
}

fn binary(kind: BinaryOpType, lhs: &Var, rhs: &Var) -> Var {
    op1(Op::Binary(kind), vec![lhs.clone(), rhs.clone()])
}

pub fn add(lhs: &Var, rhs: &Var) -> Var {
    binary(BinaryOpType::Add, lhs, rhs)
}

pub fn sub(lhs: &Var, rhs: &Var) -> Var {
    binary(BinaryOpType::Sub, lhs, rhs)
}

pub fn mul(lhs: &Var, rhs: &Var) -> Var {
    binary(BinaryOpType::Mul, lhs, rhs)
}

pub fn div(lhs: &Var, rhs: &Var) -> Var {
    binary(BinaryOpType::Div, lhs, rhs)
}

pub fn neg(x: &Var) -> Var {
    op1(Op::Unary(UnaryOpType::Neg), vec![x.clone()])
}

pub fn sqrt(x: &Var) -> Var {
    op1(Op::Unary(UnaryOpType::Sqrt), vec![x.clone()])
}

pub fn reduce_sum(x: &Var, dims: &[i32], keep_dims: bool) -> Var {
    op1(
        Op::Reduce {
            kind: ReduceType::Sum,
            dims: dims.to_vec(),
            keep_dims,
        },
        vec![x.clone()],
    )
}

pub fn reduce_mean(x: &Var, dims: &[i32], keep_dims: bool) -> Var {
    op1(
        Op::Reduce {
            kind: ReduceType::Mean,
            dims: dims.to_vec(),
            keep_dims,
        },
        vec![x.clone()],
    )
}

/// Reshape `x` to the int32 content of `shape`. The result's shape follows
/// that content, so changing it re-resolves every consumer.
pub fn reshape(x: &Var, shape: &Var) -> Var {
    op1(Op::Reshape, vec![x.clone(), shape.clone()])
}

/// Reshape to fixed extents. `-1` infers one axis, `0` keeps the input's.
pub fn reshape_to(x: &Var, dims: &[i32]) -> Result<Var> {
    let shape = constant(dims, &[dims.len() as i32])?;
    Ok(reshape(x, &shape))
}

/// The extents of `x` as an int32 vector.
pub fn shape(x: &Var) -> Var {
    op1(Op::Shape, vec![x.clone()])
}

pub fn matmul(lhs: &Var, rhs: &Var) -> Var {
    op1(Op::MatMul, vec![lhs.clone(), rhs.clone()])
}

/// Split `x` into `parts` equal slices along `axis`.
pub fn split(x: &Var, axis: i32, parts: usize) -> Vec<Var> {
    let expr = Expr::create_op(Op::Split { axis, parts }, vec![x.clone()], "");
    (0..parts).map(|i| Var::new(expr.clone(), i)).collect()
}

impl Var {
    pub fn mean(&self, dims: &[i32]) -> Var {
        reduce_mean(self, dims, false)
    }

    pub fn sum(&self, dims: &[i32]) -> Var {
        reduce_sum(self, dims, false)
    }

    pub fn sqrt(&self) -> Var {
        sqrt(self)
    }

    pub fn matmul(&self, rhs: &Var) -> Var {
        matmul(self, rhs)
    }
}

macro_rules! var_binop {
    ($trait:ident, $fn_name:ident) => {
        impl $trait for Var {
            type Output = Var;
            /// Add an elementwise node to the graph.
            fn $fn_name(self, rhs: Self) -> Var {
                $fn_name(&self, &rhs)
            }
        }

        impl $trait<&Var> for &Var {
            type Output = Var;
            fn $fn_name(self, rhs: &Var) -> Var {
                $fn_name(self, rhs)
            }
        }
    };
}

var_binop!(Add, add);
var_binop!(Sub, sub);
var_binop!(Mul, mul);
var_binop!(Div, div);

impl Neg for Var {
    type Output = Var;
    fn neg(self) -> Var {
        neg(&self)
    }
}

impl Neg for &Var {
    type Output = Var;
    fn neg(self) -> Var {
        neg(self)
    }
}
