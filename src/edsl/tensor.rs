use std::{fmt, sync::Arc};

use crossbeam_utils::sync::ShardedLock;
use itertools::Itertools;
use ndarray::ArrayD;

use crate::{
    dtype::DType,
    edsl::shape::{broadcast_dims, LogicalShape},
    exec::buffer::Buffer,
    ArcLock,
};

pub type TensorId = uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Sqrt,
    Exp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    NotEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Mean,
}

/// Operator vocabulary of the symbolic builder.
#[derive(Debug, Clone)]
pub enum Expr {
    Placeholder,
    Constant(ArrayD<f64>),
    Variable(ArcLock<Buffer>),
    Unary(UnaryOp, Tensor),
    Binary(BinaryOp, Tensor, Tensor),
    Cast(Tensor),
    Reduce {
        op: ReduceOp,
        input: Tensor,
        /// Normalised, deduplicated and sorted in descending order.
        axes: Vec<usize>,
        keepdims: bool,
    },
    Tile(Tensor, Vec<usize>),
    ExpandDims(Tensor, usize),
    ZerosLike(Tensor),
    RandomUniform {
        state: Tensor,
        dims: Vec<usize>,
        minval: f64,
        maxval: f64,
    },
}

impl Expr {
    pub fn op_name(&self) -> &'static str {
        match self {
            Expr::Placeholder => "placeholder",
            Expr::Constant(_) => "constant",
            Expr::Variable(_) => "variable",
            Expr::Unary(UnaryOp::Neg, _) => "neg",
            Expr::Unary(UnaryOp::Sqrt, _) => "sqrt",
            Expr::Unary(UnaryOp::Exp, _) => "exp",
            Expr::Binary(BinaryOp::Add, _, _) => "add",
            Expr::Binary(BinaryOp::Sub, _, _) => "sub",
            Expr::Binary(BinaryOp::Mul, _, _) => "mul",
            Expr::Binary(BinaryOp::Div, _, _) => "div",
            Expr::Binary(BinaryOp::NotEqual, _, _) => "not_equal",
            Expr::Cast(_) => "cast",
            Expr::Reduce {
                op: ReduceOp::Sum, ..
            } => "sum",
            Expr::Reduce {
                op: ReduceOp::Mean, ..
            } => "mean",
            Expr::Tile(_, _) => "tile",
            Expr::ExpandDims(_, _) => "expand_dims",
            Expr::ZerosLike(_) => "zeros_like",
            Expr::RandomUniform { .. } => "random_uniform",
        }
    }

    pub fn operands(&self) -> Vec<&Tensor> {
        match self {
            Expr::Placeholder | Expr::Constant(_) | Expr::Variable(_) => vec![],
            Expr::Unary(_, input)
            | Expr::Cast(input)
            | Expr::Reduce { input, .. }
            | Expr::Tile(input, _)
            | Expr::ExpandDims(input, _)
            | Expr::ZerosLike(input) => vec![input],
            Expr::Binary(_, lhs, rhs) => vec![lhs, rhs],
            Expr::RandomUniform { state, .. } => vec![state],
        }
    }

    /// Output dims given the dims of each operand, in `operands()` order.
    ///
    /// Unknown dims propagate as `None`; two known dims that cannot agree are an error.
    pub(crate) fn infer_dims(
        &self,
        operand_dims: &[Vec<Option<usize>>],
    ) -> Result<Vec<Option<usize>>, String> {
        match self {
            Expr::Placeholder | Expr::Variable(_) => {
                Err("leaf dims are not derived from operands".to_string())
            }
            Expr::Constant(value) => Ok(value.shape().iter().map(|d| Some(*d)).collect()),
            Expr::Unary(_, _) | Expr::Cast(_) | Expr::ZerosLike(_) => Ok(operand_dims[0].clone()),
            Expr::Binary(op, _, _) => broadcast_logical(&operand_dims[0], &operand_dims[1])
                .ok_or_else(|| {
                    format!(
                        "{:?} cannot broadcast {} with {}",
                        op,
                        fmt_dims(&operand_dims[0]),
                        fmt_dims(&operand_dims[1])
                    )
                }),
            Expr::Reduce { axes, keepdims, .. } => {
                let mut dims = operand_dims[0].clone();
                for axis in axes {
                    if *axis >= dims.len() {
                        return Err(format!(
                            "reduction axis {} out of range for {}",
                            axis,
                            fmt_dims(&operand_dims[0])
                        ));
                    }
                    if *keepdims {
                        dims[*axis] = Some(1);
                    } else {
                        dims.remove(*axis);
                    }
                }
                Ok(dims)
            }
            Expr::Tile(_, repeats) => {
                let dims = &operand_dims[0];
                if dims.len() != repeats.len() {
                    return Err(format!(
                        "tile repeats {:?} do not match {}",
                        repeats,
                        fmt_dims(dims)
                    ));
                }
                Ok(dims
                    .iter()
                    .zip(repeats)
                    .map(|(d, n)| d.map(|d| d * n))
                    .collect())
            }
            Expr::ExpandDims(_, axis) => {
                let mut dims = operand_dims[0].clone();
                if *axis > dims.len() {
                    return Err(format!(
                        "expand_dims axis {} out of range for {}",
                        axis,
                        fmt_dims(&dims)
                    ));
                }
                dims.insert(*axis, Some(1));
                Ok(dims)
            }
            Expr::RandomUniform { dims, .. } => Ok(dims.iter().map(|d| Some(*d)).collect()),
        }
    }
}

fn fmt_dims(dims: &[Option<usize>]) -> String {
    let dims = dims
        .iter()
        .map(|d| d.map_or_else(|| "?".to_string(), |d| d.to_string()))
        .join(", ");
    format!("({})", dims)
}

fn broadcast_logical(lhs: &[Option<usize>], rhs: &[Option<usize>]) -> Option<Vec<Option<usize>>> {
    let concrete = |dims: &[Option<usize>]| dims.iter().cloned().collect::<Option<Vec<usize>>>();
    if let (Some(l), Some(r)) = (concrete(lhs), concrete(rhs)) {
        return broadcast_dims(&l, &r).map(|dims| dims.into_iter().map(Some).collect());
    }
    let ndims = lhs.len().max(rhs.len());
    let align = |dims: &[Option<usize>], i: usize| {
        if i < ndims - dims.len() {
            Some(1)
        } else {
            dims[i - (ndims - dims.len())]
        }
    };
    (0..ndims)
        .map(|i| match (align(lhs, i), align(rhs, i)) {
            (Some(l), Some(r)) if l == r => Some(Some(l)),
            (Some(1), other) | (other, Some(1)) => Some(other),
            (Some(_), Some(_)) => None,
            (known @ Some(_), None) | (None, known @ Some(_)) => Some(known),
            (None, None) => Some(None),
        })
        .collect()
}

#[derive(Debug)]
pub(crate) struct TensorNode {
    id: TensorId,
    name: String,
    shape: LogicalShape,
    expr: Expr,
}

/// Symbolic tensor handle. Cloning shares the underlying expression node.
#[derive(Clone)]
pub struct Tensor {
    node: Arc<TensorNode>,
}

impl Tensor {
    fn from_expr(name: &str, shape: LogicalShape, expr: Expr) -> Tensor {
        Tensor {
            node: Arc::new(TensorNode {
                id: uuid::Uuid::new_v4(),
                name: name.to_string(),
                shape,
                expr,
            }),
        }
    }

    fn derived(expr: Expr, dtype: DType) -> Tensor {
        let operand_dims = expr
            .operands()
            .iter()
            .map(|t| t.shape().dims.clone())
            .collect::<Vec<_>>();
        // Conflicts between known dims surface when the program is specialised.
        let dims = expr
            .infer_dims(&operand_dims)
            .unwrap_or_else(|_| vec![None; operand_dims.iter().map(Vec::len).max().unwrap_or(0)]);
        let name = expr.op_name();
        Tensor::from_expr(name, LogicalShape::new(dtype, dims), expr)
    }

    pub fn placeholder(shape: LogicalShape, name: &str) -> Tensor {
        Tensor::from_expr(name, shape, Expr::Placeholder)
    }

    pub fn constant(value: ArrayD<f64>, dtype: DType, name: &str) -> Tensor {
        let value = value.mapv(|v| dtype.coerce(v));
        let shape = LogicalShape::concrete(dtype, value.shape());
        Tensor::from_expr(name, shape, Expr::Constant(value))
    }

    pub fn scalar(value: f64, dtype: DType) -> Tensor {
        Tensor::constant(ArrayD::from_elem(vec![], value), dtype, "scalar")
    }

    pub fn variable(initial: Buffer, name: &str) -> Tensor {
        let shape = LogicalShape::concrete(initial.dtype(), initial.dims());
        Tensor::from_expr(
            name,
            shape,
            Expr::Variable(Arc::new(ShardedLock::new(initial))),
        )
    }

    pub fn id(&self) -> TensorId {
        self.node.id
    }

    pub fn name(&self) -> &str {
        &self.node.name
    }

    pub fn shape(&self) -> &LogicalShape {
        &self.node.shape
    }

    pub fn dtype(&self) -> DType {
        self.node.shape.dtype
    }

    pub fn ndims(&self) -> usize {
        self.node.shape.ndims()
    }

    pub fn expr(&self) -> &Expr {
        &self.node.expr
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.node.expr, Expr::Placeholder)
    }

    pub fn variable_storage(&self) -> Option<&ArcLock<Buffer>> {
        match &self.node.expr {
            Expr::Variable(storage) => Some(storage),
            _ => None,
        }
    }

    fn unary(&self, op: UnaryOp) -> Tensor {
        Tensor::derived(Expr::Unary(op, self.clone()), self.dtype())
    }

    fn binary(&self, op: BinaryOp, rhs: &Tensor) -> Tensor {
        let dtype = match op {
            BinaryOp::NotEqual => DType::Boolean,
            _ => self.dtype().promote(rhs.dtype()),
        };
        Tensor::derived(Expr::Binary(op, self.clone(), rhs.clone()), dtype)
    }

    /// Scalars adopt the tensor's dtype rather than promoting it.
    fn scalar_like(&self, value: f64) -> Tensor {
        Tensor::scalar(value, self.dtype())
    }

    pub fn neg(&self) -> Tensor {
        self.unary(UnaryOp::Neg)
    }

    pub fn sqrt(&self) -> Tensor {
        self.unary(UnaryOp::Sqrt)
    }

    pub fn exp(&self) -> Tensor {
        self.unary(UnaryOp::Exp)
    }

    pub fn add(&self, rhs: &Tensor) -> Tensor {
        self.binary(BinaryOp::Add, rhs)
    }

    pub fn sub(&self, rhs: &Tensor) -> Tensor {
        self.binary(BinaryOp::Sub, rhs)
    }

    pub fn mul(&self, rhs: &Tensor) -> Tensor {
        self.binary(BinaryOp::Mul, rhs)
    }

    pub fn div(&self, rhs: &Tensor) -> Tensor {
        self.binary(BinaryOp::Div, rhs)
    }

    pub fn not_equal(&self, rhs: &Tensor) -> Tensor {
        self.binary(BinaryOp::NotEqual, rhs)
    }

    pub fn not_equal_scalar(&self, rhs: f64) -> Tensor {
        self.not_equal(&self.scalar_like(rhs))
    }

    pub fn cast(&self, dtype: DType) -> Tensor {
        Tensor::derived(Expr::Cast(self.clone()), dtype)
    }

    /// `axes` must already be normalised into `0..ndims`.
    pub fn reduce(&self, op: ReduceOp, axes: &[usize], keepdims: bool) -> Tensor {
        let mut axes = axes.to_vec();
        axes.sort_unstable_by(|a, b| b.cmp(a));
        axes.dedup();
        Tensor::derived(
            Expr::Reduce {
                op,
                input: self.clone(),
                axes,
                keepdims,
            },
            self.dtype(),
        )
    }

    pub fn sum(&self, axes: &[usize], keepdims: bool) -> Tensor {
        self.reduce(ReduceOp::Sum, axes, keepdims)
    }

    pub fn mean(&self, axes: &[usize], keepdims: bool) -> Tensor {
        self.reduce(ReduceOp::Mean, axes, keepdims)
    }

    pub fn tile(&self, repeats: &[usize]) -> Tensor {
        Tensor::derived(Expr::Tile(self.clone(), repeats.to_vec()), self.dtype())
    }

    pub fn expand_dims(&self, axis: usize) -> Tensor {
        Tensor::derived(Expr::ExpandDims(self.clone(), axis), self.dtype())
    }

    pub fn zeros_like(&self, dtype: DType) -> Tensor {
        Tensor::derived(Expr::ZerosLike(self.clone()), dtype)
    }

    /// Uniform samples in `[minval, maxval)` drawn from a `(3, n)` uint32 generator state.
    pub fn random_uniform(
        state: &Tensor,
        dims: &[usize],
        minval: f64,
        maxval: f64,
        dtype: DType,
    ) -> Tensor {
        Tensor::derived(
            Expr::RandomUniform {
                state: state.clone(),
                dims: dims.to_vec(),
                minval,
                maxval,
            },
            dtype,
        )
    }
}

impl PartialEq for Tensor {
    fn eq(&self, rhs: &Tensor) -> bool {
        Arc::ptr_eq(&self.node, &rhs.node)
    }
}

impl Eq for Tensor {}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("id", &self.node.id)
            .field("name", &self.node.name)
            .field("shape", &self.node.shape)
            .field("op", &self.node.expr.op_name())
            .finish()
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.node.name, self.node.shape)
    }
}

macro_rules! tensor_binary_ops {
    ($($trait:ident, $method:ident);*) => {
        $(
            impl<'a> std::ops::$trait<&'a Tensor> for &'a Tensor {
                type Output = Tensor;

                fn $method(self, rhs: &'a Tensor) -> Tensor {
                    Tensor::$method(self, rhs)
                }
            }

            impl<'a> std::ops::$trait<f64> for &'a Tensor {
                type Output = Tensor;

                fn $method(self, rhs: f64) -> Tensor {
                    Tensor::$method(self, &self.scalar_like(rhs))
                }
            }
        )*
    };
}

tensor_binary_ops!(Add, add; Sub, sub; Mul, mul; Div, div);

impl<'a> std::ops::Neg for &'a Tensor {
    type Output = Tensor;

    fn neg(self) -> Tensor {
        Tensor::neg(self)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn placeholder(dims: Vec<Option<usize>>) -> Tensor {
        Tensor::placeholder(LogicalShape::new(DType::Float32, dims), "x")
    }

    #[test]
    fn elementwise_keeps_unknown_dims() {
        let x = placeholder(vec![None, Some(4)]);
        let y = &x * &x;
        assert_eq!(y.shape().dims, vec![None, Some(4)]);
        assert_eq!(y.dtype(), DType::Float32);
        assert_eq!(y.name(), "mul");
        assert_eq!(y.expr().operands(), vec![&x, &x]);
    }

    #[test]
    fn broadcast_against_scalar_and_row() {
        let x = placeholder(vec![None, Some(4)]);
        let row = Tensor::constant(ArrayD::zeros(vec![4]), DType::Float64, "row");
        let y = &(&x + 1.0) - &row;
        assert_eq!(y.shape().dims, vec![None, Some(4)]);
        assert_eq!(y.dtype(), DType::Float64);
    }

    #[test]
    fn conflicting_known_dims_become_unknown() {
        let x = placeholder(vec![Some(2), Some(4)]);
        let y = placeholder(vec![Some(3)]);
        assert_eq!(x.add(&y).shape().dims, vec![None, None]);
    }

    #[test]
    fn reduction_shapes() {
        let x = placeholder(vec![Some(2), None, Some(5)]);
        assert_eq!(x.sum(&[0, 2], false).shape().dims, vec![None]);
        assert_eq!(
            x.mean(&[2, 0, 2], true).shape().dims,
            vec![Some(1), None, Some(1)]
        );
        match x.sum(&[0, 2, 2], false).expr() {
            Expr::Reduce { axes, .. } => assert_eq!(axes, &vec![2, 0]),
            other => panic!("unexpected expression {:?}", other.op_name()),
        }
    }

    #[test]
    fn tile_and_expand_dims() {
        let x = placeholder(vec![None, Some(3)]);
        assert_eq!(x.tile(&[2, 2]).shape().dims, vec![None, Some(6)]);
        assert_eq!(x.expand_dims(1).shape().dims, vec![None, Some(1), Some(3)]);
        assert_eq!(x.not_equal_scalar(0.0).dtype(), DType::Boolean);
    }

    #[test]
    fn handles_compare_by_identity() {
        let x = placeholder(vec![Some(1)]);
        let y = placeholder(vec![Some(1)]);
        assert_eq!(x, x.clone());
        assert_ne!(x, y);
    }
}
