//! Symbolic tensor expressions.
//!
//! Tensors are built against logical shapes whose dims may be unknown. A [`Program`] takes a
//! set of output tensors together with concrete [`ShapeBindings`] for the placeholders they read
//! and resolves every node to a concrete [`TensorShape`].

pub mod program;
pub mod shape;
pub mod tensor;

pub use program::{Program, ShapeBindings};
pub use shape::{LogicalShape, TensorShape};
pub use tensor::{BinaryOp, Expr, ReduceOp, Tensor, TensorId, UnaryOp};
