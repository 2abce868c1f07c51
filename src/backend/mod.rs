//! Tensor-backend call surface.
//!
//! Each call translates one backend operation into symbolic builder calls and wraps the result
//! in a named [`Node`]. All naming and unique-id state lives in the [`Backend`] value.

use std::{fmt, sync::Arc};

use crossbeam_utils::sync::{ShardedLock, ShardedLockWriteGuard};
use log::debug;
use ndarray::{ArrayD, IxDyn};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    config::RuntimeConfig,
    dtype::DType,
    edsl::{LogicalShape, Tensor},
    error::{BridgeError, BridgeResult},
    exec::{Buffer, Compiler, ReferenceCompiler},
    function::{CompiledFunction, LogicalFunction},
};

mod naming;

use naming::Naming;

const BACKEND_NAME: &str = "tile";
const RNG_COLUMNS: usize = 2048;

/// A symbolic tensor as seen by backend callers.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    name: String,
    tensor: Tensor,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.tensor.shape())
    }
}

/// Values that can be turned into variables or constants.
#[derive(Debug, Clone)]
pub enum Value {
    Scalar(f64),
    List(Vec<f64>),
    Array(ArrayD<f64>),
    Node(Node),
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Scalar(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Scalar(value as f64)
    }
}

impl From<Vec<f64>> for Value {
    fn from(values: Vec<f64>) -> Self {
        Value::List(values)
    }
}

impl From<ArrayD<f64>> for Value {
    fn from(values: ArrayD<f64>) -> Self {
        Value::Array(values)
    }
}

impl From<Node> for Value {
    fn from(node: Node) -> Self {
        Value::Node(node)
    }
}

impl Value {
    fn into_array(self, op: &str) -> BridgeResult<ArrayD<f64>> {
        match self {
            Value::Scalar(value) => Ok(ArrayD::from_elem(IxDyn(&[]), value)),
            Value::List(values) => Ok(ArrayD::from_shape_vec(IxDyn(&[values.len()]), values)
                .map_err(|err| BridgeError::invalid(op, err.to_string()))?),
            Value::Array(values) => Ok(values),
            Value::Node(node) => Err(BridgeError::invalid(
                op,
                format!("cannot materialise symbolic node {}", node.name),
            )),
        }
    }
}

/// Either side of a binary operation.
#[derive(Debug, Clone, Copy)]
pub enum Operand<'a> {
    Node(&'a Node),
    Scalar(f64),
}

impl<'a> From<&'a Node> for Operand<'a> {
    fn from(node: &'a Node) -> Self {
        Operand::Node(node)
    }
}

impl<'a> From<f64> for Operand<'a> {
    fn from(value: f64) -> Self {
        Operand::Scalar(value)
    }
}

/// Pops its name scope when dropped.
pub struct NameScopeGuard<'a> {
    backend: &'a Backend,
}

impl<'a> Drop for NameScopeGuard<'a> {
    fn drop(&mut self) {
        self.backend.naming().pop_scope();
    }
}

/// Reduce `axes` into `0..ndims`, largest first. `None` selects the last axis.
pub(crate) fn aggregation_axes(ndims: usize, axes: Option<&[isize]>) -> BridgeResult<Vec<usize>> {
    let axes = match axes {
        Some(axes) => axes.to_vec(),
        None if ndims == 0 => vec![],
        None => vec![ndims as isize - 1],
    };
    let mut normalised = axes
        .iter()
        .map(|axis| {
            let resolved = if *axis < 0 {
                ndims as isize + axis
            } else {
                *axis
            };
            if resolved < 0 || resolved >= ndims as isize {
                Err(BridgeError::invalid(
                    "reduce",
                    format!("axis {} is out of range for {} dims", axis, ndims),
                ))
            } else {
                Ok(resolved as usize)
            }
        })
        .collect::<BridgeResult<Vec<_>>>()?;
    normalised.sort_unstable_by(|a, b| b.cmp(a));
    normalised.dedup();
    Ok(normalised)
}

pub struct Backend {
    config: RuntimeConfig,
    compiler: Arc<dyn Compiler>,
    naming: ShardedLock<Naming>,
    floatx: DType,
}

impl Backend {
    pub fn new(config: RuntimeConfig, compiler: Arc<dyn Compiler>) -> Self {
        let floatx = config.floatx;
        Backend {
            config,
            compiler,
            naming: ShardedLock::new(Naming::default()),
            floatx,
        }
    }

    /// Backend over the native reference runtime.
    pub fn reference(config: RuntimeConfig) -> Self {
        Backend::new(config, Arc::new(ReferenceCompiler::new()))
    }

    pub fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn naming(&self) -> ShardedLockWriteGuard<'_, Naming> {
        self.naming
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn name_scope(&self, name: &str) -> NameScopeGuard<'_> {
        self.naming().push_scope(name);
        NameScopeGuard { backend: self }
    }

    pub fn get_uid(&self, prefix: &str) -> u64 {
        self.naming().next_uid(prefix)
    }

    pub fn reset_uids(&self) {
        self.naming().reset_uids()
    }

    pub fn floatx(&self) -> DType {
        self.floatx
    }

    pub fn set_floatx(&mut self, dtype: &str) -> BridgeResult<()> {
        self.floatx = DType::from_name(dtype)?;
        Ok(())
    }

    fn resolve_dtype(&self, dtype: Option<&str>) -> BridgeResult<DType> {
        match dtype {
            Some(name) => DType::from_name(name),
            None => Ok(self.floatx),
        }
    }

    fn node(&self, op: &str, name: Option<&str>, tensor: Tensor) -> Node {
        let name = self.naming().prepend_scope(name, op);
        Node { name, tensor }
    }

    pub fn placeholder(
        &self,
        shape: Option<&[Option<usize>]>,
        ndim: Option<usize>,
        dtype: Option<&str>,
        name: Option<&str>,
    ) -> BridgeResult<Node> {
        let dtype = self.resolve_dtype(dtype)?;
        let dims = match (shape, ndim) {
            (Some(shape), _) => shape.to_vec(),
            (None, Some(ndim)) => vec![None; ndim],
            (None, None) => {
                return Err(BridgeError::invalid(
                    "placeholder",
                    "either a shape or a number of dims is required",
                ))
            }
        };
        let name = self.naming().prepend_scope(name, "placeholder");
        let tensor = Tensor::placeholder(LogicalShape::new(dtype, dims), &name);
        Ok(Node { name, tensor })
    }

    pub fn variable(
        &self,
        value: impl Into<Value>,
        dtype: Option<&str>,
        name: Option<&str>,
    ) -> BridgeResult<Node> {
        let value = value.into();
        if let Value::Node(node) = value {
            return Ok(node);
        }
        let dtype = self.resolve_dtype(dtype)?;
        let data = value.into_array("variable")?;
        let name = self.naming().prepend_scope(name, "variable");
        let tensor = Tensor::variable(Buffer::new(dtype, data), &name);
        Ok(Node { name, tensor })
    }

    /// A constant filled to `shape`. Without a shape, scalars become `(1,)`.
    pub fn constant(
        &self,
        value: impl Into<Value>,
        dtype: Option<&str>,
        shape: Option<&[usize]>,
        name: Option<&str>,
    ) -> BridgeResult<Node> {
        let dtype = self.resolve_dtype(dtype)?;
        let base = value.into().into_array("constant")?;
        let dims = match shape {
            Some(shape) => shape.to_vec(),
            None if base.ndim() == 0 => vec![1],
            None => base.shape().to_vec(),
        };
        let filled = base
            .broadcast(IxDyn(&dims))
            .ok_or_else(|| {
                BridgeError::invalid(
                    "constant",
                    format!("value of shape {:?} cannot fill {:?}", base.shape(), dims),
                )
            })?
            .to_owned();
        let name = self.naming().prepend_scope(name, "constant");
        let tensor = Tensor::constant(filled, dtype, &name);
        Ok(Node { name, tensor })
    }

    pub fn cast(&self, x: &Node, dtype: &str) -> BridgeResult<Node> {
        let dtype = DType::from_name(dtype)?;
        if x.tensor.dtype() == dtype {
            return Ok(x.clone());
        }
        Ok(self.node("cast", None, x.tensor.cast(dtype)))
    }

    pub fn dtype(&self, x: &Node) -> &'static str {
        x.tensor.dtype().name()
    }

    /// Declared dims, `None` where unknown.
    pub fn int_shape(&self, x: &Node) -> Vec<Option<usize>> {
        x.tensor.shape().dims.clone()
    }

    pub fn ndim(&self, x: &Node) -> usize {
        x.tensor.ndims()
    }

    pub fn is_sparse(&self, _x: &Node) -> bool {
        false
    }

    fn binary(
        &self,
        op: &str,
        lhs: Operand<'_>,
        rhs: Operand<'_>,
        build: impl Fn(&Tensor, &Tensor) -> Tensor,
    ) -> BridgeResult<Node> {
        let tensor = match (lhs, rhs) {
            (Operand::Node(lhs), Operand::Node(rhs)) => build(&lhs.tensor, &rhs.tensor),
            (Operand::Node(lhs), Operand::Scalar(rhs)) => {
                build(&lhs.tensor, &Tensor::scalar(rhs, lhs.tensor.dtype()))
            }
            (Operand::Scalar(lhs), Operand::Node(rhs)) => {
                build(&Tensor::scalar(lhs, rhs.tensor.dtype()), &rhs.tensor)
            }
            (Operand::Scalar(_), Operand::Scalar(_)) => {
                return Err(BridgeError::invalid(op, "at least one operand must be a node"))
            }
        };
        Ok(self.node(op, None, tensor))
    }

    pub fn add<'a>(
        &self,
        lhs: impl Into<Operand<'a>>,
        rhs: impl Into<Operand<'a>>,
    ) -> BridgeResult<Node> {
        self.binary("add", lhs.into(), rhs.into(), Tensor::add)
    }

    pub fn sub<'a>(
        &self,
        lhs: impl Into<Operand<'a>>,
        rhs: impl Into<Operand<'a>>,
    ) -> BridgeResult<Node> {
        self.binary("sub", lhs.into(), rhs.into(), Tensor::sub)
    }

    pub fn mul<'a>(
        &self,
        lhs: impl Into<Operand<'a>>,
        rhs: impl Into<Operand<'a>>,
    ) -> BridgeResult<Node> {
        self.binary("mul", lhs.into(), rhs.into(), Tensor::mul)
    }

    pub fn div<'a>(
        &self,
        lhs: impl Into<Operand<'a>>,
        rhs: impl Into<Operand<'a>>,
    ) -> BridgeResult<Node> {
        self.binary("div", lhs.into(), rhs.into(), Tensor::div)
    }

    pub fn not_equal<'a>(
        &self,
        lhs: &'a Node,
        rhs: impl Into<Operand<'a>>,
    ) -> BridgeResult<Node> {
        self.binary("not_equal", Operand::Node(lhs), rhs.into(), Tensor::not_equal)
    }

    pub fn neg(&self, x: &Node) -> Node {
        self.node("neg", None, x.tensor.neg())
    }

    pub fn sqrt(&self, x: &Node) -> Node {
        self.node("sqrt", None, x.tensor.sqrt())
    }

    pub fn exp(&self, x: &Node) -> Node {
        self.node("exp", None, x.tensor.exp())
    }

    pub fn square(&self, x: &Node) -> Node {
        self.node("square", None, x.tensor.mul(&x.tensor))
    }

    /// Sum over `axis`, the last axis when `None`.
    pub fn sum(&self, x: &Node, axis: Option<&[isize]>, keepdims: bool) -> BridgeResult<Node> {
        let axes = aggregation_axes(x.tensor.ndims(), axis)?;
        Ok(self.node("sum", None, x.tensor.sum(&axes, keepdims)))
    }

    /// Mean over `axis`, every axis when `None`.
    pub fn mean(&self, x: &Node, axis: Option<&[isize]>, keepdims: bool) -> BridgeResult<Node> {
        if x.tensor.ndims() == 0 {
            return Ok(x.clone());
        }
        if let Some(axis) = axis {
            if axis.is_empty() {
                return Ok(x.clone());
            }
        }
        let x = if x.tensor.dtype() == DType::Boolean {
            self.cast(x, self.floatx.name())?
        } else {
            x.clone()
        };
        let all_axes = (0..x.tensor.ndims() as isize).collect::<Vec<_>>();
        let axes = aggregation_axes(x.tensor.ndims(), Some(axis.unwrap_or(&all_axes)))?;
        Ok(self.node("mean", None, x.tensor.mean(&axes, keepdims)))
    }

    pub fn tile(&self, x: &Node, n: &[usize]) -> BridgeResult<Node> {
        if n.len() != x.tensor.ndims() {
            return Err(BridgeError::invalid(
                "tile",
                format!(
                    "{} repeats given for a tensor with {} dims",
                    n.len(),
                    x.tensor.ndims()
                ),
            ));
        }
        Ok(self.node("tile", None, x.tensor.tile(n)))
    }

    /// Insert a unit axis; negative axes count from `ndims + 1`.
    pub fn expand_dims(&self, x: &Node, axis: isize, name: Option<&str>) -> BridgeResult<Node> {
        let ndims = x.tensor.ndims() as isize;
        let resolved = if axis < 0 { ndims + 1 + axis } else { axis };
        if resolved < 0 || resolved > ndims {
            return Err(BridgeError::invalid(
                "expand_dims",
                format!("axis {} is out of range for {} dims", axis, ndims),
            ));
        }
        Ok(self.node(
            "expand_dims",
            name,
            x.tensor.expand_dims(resolved as usize),
        ))
    }

    pub fn zeros_like(
        &self,
        x: &Node,
        dtype: Option<&str>,
        name: Option<&str>,
    ) -> BridgeResult<Node> {
        let dtype = self.resolve_dtype(dtype)?;
        Ok(self.node("zeros_like", name, x.tensor.zeros_like(dtype)))
    }

    /// Uniform samples in `[minval, maxval)` from a freshly seeded generator state.
    pub fn random_uniform(
        &self,
        shape: &[usize],
        minval: f64,
        maxval: f64,
        dtype: Option<&str>,
        seed: Option<u64>,
    ) -> BridgeResult<Node> {
        let dtype = self.resolve_dtype(dtype)?;
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        // each Tausworthe component needs a seed above its lower bound
        let mut words = Vec::with_capacity(3 * RNG_COLUMNS);
        for lower in &[2_u32, 8, 16] {
            words.extend((0..RNG_COLUMNS).map(|_| f64::from(rng.gen_range(*lower..=u32::MAX))));
        }
        let state = Buffer::from_vec(DType::UInt32, &[3, RNG_COLUMNS], words)?;
        let state_name = self.naming().prepend_scope(None, "rng_state");
        let state = Tensor::variable(state, &state_name);
        Ok(self.node(
            "random_uniform",
            None,
            Tensor::random_uniform(&state, shape, minval, maxval, dtype),
        ))
    }

    /// Wrap a computation so it compiles lazily, once per distinct set of input shapes.
    pub fn function(
        &self,
        inputs: &[Node],
        outputs: &[Node],
        updates: &[(Node, Node)],
        name: Option<&str>,
    ) -> BridgeResult<CompiledFunction> {
        let function = LogicalFunction::new(
            name.unwrap_or(""),
            inputs.iter().map(|n| n.tensor.clone()).collect(),
            outputs.iter().map(|n| n.tensor.clone()).collect(),
            updates
                .iter()
                .map(|(target, value)| (target.tensor.clone(), value.tensor.clone()))
                .collect(),
        )?;
        debug!(
            "Defined function {:?} with {} inputs and {} outputs",
            function.name(),
            inputs.len(),
            outputs.len()
        );
        Ok(CompiledFunction::new(
            function,
            Arc::clone(&self.compiler),
            self.config.clone(),
        ))
    }
}
