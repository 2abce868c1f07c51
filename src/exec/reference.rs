use std::{collections::HashMap, sync::Arc};

use itertools::Itertools;
use log::debug;
use ndarray::{ArrayD, Axis, Dimension, IxDyn, Zip};

use crate::{
    dtype::DType,
    edsl::{BinaryOp, Expr, Program, ReduceOp, Tensor, TensorId, TensorShape, UnaryOp},
    error::{BridgeError, BridgeResult},
    exec::{Binding, Buffer, Compiler, Executable},
};

const TARGETS: [&str; 2] = ["native", "llvm_cpu"];

/// Native interpreter over `ndarray`, standing in for a device runtime.
#[derive(Debug, Clone, Default)]
pub struct ReferenceCompiler;

impl ReferenceCompiler {
    pub fn new() -> Self {
        ReferenceCompiler
    }
}

struct Step {
    tensor: Tensor,
    shape: TensorShape,
}

pub struct ReferenceExecutable {
    program: String,
    device_id: Option<String>,
    inputs: Vec<Binding>,
    outputs: Vec<Binding>,
    plan: Vec<Step>,
}

fn check_bindings(program: &Program, bindings: &[Binding], kind: &str) -> BridgeResult<()> {
    for (tensor, buffer) in bindings {
        match program.shape_of(tensor) {
            Some(shape) if *shape == buffer.shape() => {}
            Some(shape) => {
                return Err(BridgeError::compilation(
                    program.name(),
                    format!(
                        "{} binding for {} has shape {} but the program expects {}",
                        kind,
                        tensor.name(),
                        buffer.shape(),
                        shape
                    ),
                ))
            }
            None => {
                return Err(BridgeError::compilation(
                    program.name(),
                    format!("{} binding {} is not part of the program", kind, tensor),
                ))
            }
        }
    }
    Ok(())
}

impl Compiler for ReferenceCompiler {
    fn compile(
        &self,
        program: &Program,
        device_id: Option<&str>,
        target: Option<&str>,
        input_bindings: Vec<Binding>,
        output_bindings: Vec<Binding>,
    ) -> BridgeResult<Arc<dyn Executable>> {
        if let Some(target) = target {
            if !TARGETS.contains(&target) {
                return Err(BridgeError::compilation(
                    program.name(),
                    format!("unknown target {:?}", target),
                ));
            }
        }
        check_bindings(program, &input_bindings, "input")?;
        check_bindings(program, &output_bindings, "output")?;
        if output_bindings.len() != program.outputs().len()
            || output_bindings
                .iter()
                .zip(program.outputs())
                .any(|((bound, _), output)| bound != output)
        {
            return Err(BridgeError::compilation(
                program.name(),
                "output bindings do not match the program outputs",
            ));
        }
        for placeholder in program.placeholders() {
            if !input_bindings.iter().any(|(slot, _)| slot == placeholder) {
                return Err(BridgeError::compilation(
                    program.name(),
                    format!("placeholder {} has no input binding", placeholder),
                ));
            }
        }

        let plan = program
            .nodes()
            .iter()
            .map(|tensor| Step {
                tensor: tensor.clone(),
                shape: program.shape_of(tensor).cloned().unwrap_or_else(|| {
                    TensorShape::new(tensor.dtype(), tensor.shape().int_dims())
                }),
            })
            .collect::<Vec<_>>();
        debug!(
            "Lowered program {} to {} steps on device {:?}",
            program.name(),
            plan.len(),
            device_id
        );
        Ok(Arc::new(ReferenceExecutable {
            program: program.name().to_string(),
            device_id: device_id.map(str::to_string),
            inputs: input_bindings,
            outputs: output_bindings,
            plan,
        }))
    }
}

impl ReferenceExecutable {
    fn evaluate(
        &self,
        step: &Step,
        values: &HashMap<TensorId, ArrayD<f64>>,
        feeds: &HashMap<TensorId, &Buffer>,
    ) -> BridgeResult<ArrayD<f64>> {
        let dtype = step.shape.dtype;
        let operand = |tensor: &Tensor| -> BridgeResult<&ArrayD<f64>> {
            values
                .get(&tensor.id())
                .ok_or_else(|| BridgeError::runtime(format!("{} was not evaluated", tensor)))
        };
        let value = match step.tensor.expr() {
            Expr::Placeholder => feeds
                .get(&step.tensor.id())
                .ok_or_else(|| BridgeError::runtime(format!("{} was not fed", step.tensor)))?
                .cast(dtype)
                .into_data(),
            Expr::Constant(value) => value.clone(),
            Expr::Variable(storage) => {
                let current = storage
                    .read()
                    .map_err(|_| BridgeError::runtime("variable lock poisoned"))?;
                if current.dims() != step.shape.dims.as_slice() {
                    return Err(BridgeError::runtime(format!(
                        "variable {} holds {} but was compiled for {}",
                        step.tensor.name(),
                        current.shape(),
                        step.shape
                    )));
                }
                current.data().clone()
            }
            Expr::Unary(op, input) => {
                let input = operand(input)?;
                match op {
                    UnaryOp::Neg => input.mapv(|v| -v),
                    UnaryOp::Sqrt => input.mapv(f64::sqrt),
                    UnaryOp::Exp => input.mapv(f64::exp),
                }
            }
            Expr::Binary(op, lhs, rhs) => {
                binary(*op, operand(lhs)?, operand(rhs)?, &step.shape)?
            }
            Expr::Cast(input) => operand(input)?.clone(),
            Expr::Reduce {
                op,
                input,
                axes,
                keepdims,
            } => {
                let mut reduced = operand(input)?.clone();
                let mut count = 1;
                for axis in axes {
                    count *= reduced.shape()[*axis];
                    reduced = reduced.sum_axis(Axis(*axis));
                    if *keepdims {
                        reduced = reduced.insert_axis(Axis(*axis));
                    }
                }
                match op {
                    ReduceOp::Sum => reduced,
                    ReduceOp::Mean => reduced.mapv(|v| v / count as f64),
                }
            }
            Expr::Tile(input, _) => {
                let input = operand(input)?;
                let in_dims = input.shape().to_vec();
                ArrayD::from_shape_fn(IxDyn(&step.shape.dims), |index| {
                    let source = index
                        .slice()
                        .iter()
                        .zip(&in_dims)
                        .map(|(i, d)| i % d)
                        .collect::<Vec<_>>();
                    input[source.as_slice()]
                })
            }
            Expr::ExpandDims(input, axis) => operand(input)?.clone().insert_axis(Axis(*axis)),
            Expr::ZerosLike(_) => ArrayD::zeros(IxDyn(&step.shape.dims)),
            Expr::RandomUniform {
                state,
                minval,
                maxval,
                ..
            } => {
                let samples = random_uniform(operand(state)?, &step.shape, *minval, *maxval)?;
                // rounding into a narrower dtype can land exactly on the excluded bound
                let ceiling = largest_below(dtype, *maxval).max(*minval);
                return Ok(samples.mapv_into(|v| dtype.coerce(v).min(ceiling)));
            }
        };
        Ok(value.mapv_into(|v| dtype.coerce(v)))
    }
}

fn binary(
    op: BinaryOp,
    lhs: &ArrayD<f64>,
    rhs: &ArrayD<f64>,
    shape: &TensorShape,
) -> BridgeResult<ArrayD<f64>> {
    let dims = IxDyn(&shape.dims);
    let (lhs, rhs) = match (lhs.broadcast(dims.clone()), rhs.broadcast(dims)) {
        (Some(lhs), Some(rhs)) => (lhs, rhs),
        _ => {
            return Err(BridgeError::runtime(format!(
                "operands {:?} and {:?} do not broadcast to {:?}",
                lhs.shape(),
                rhs.shape(),
                shape.dims
            )))
        }
    };
    if op == BinaryOp::Div && !shape.dtype.is_float() && rhs.iter().any(|v| *v == 0.0) {
        return Err(BridgeError::runtime(format!(
            "integer division by zero in {} division",
            shape.dtype
        )));
    }
    let zip = Zip::from(&lhs).and(&rhs);
    let value = match op {
        BinaryOp::Add => zip.map_collect(|a, b| a + b),
        BinaryOp::Sub => zip.map_collect(|a, b| a - b),
        BinaryOp::Mul => zip.map_collect(|a, b| a * b),
        BinaryOp::Div => zip.map_collect(|a, b| a / b),
        BinaryOp::NotEqual => zip.map_collect(|a, b| if a != b { 1.0 } else { 0.0 }),
    };
    Ok(value)
}

fn taus_step(state: &mut [u32; 3]) -> u32 {
    state[0] = ((state[0] & 4_294_967_294) << 12) ^ (((state[0] << 13) ^ state[0]) >> 19);
    state[1] = ((state[1] & 4_294_967_288) << 4) ^ (((state[1] << 2) ^ state[1]) >> 25);
    state[2] = ((state[2] & 4_294_967_280) << 17) ^ (((state[2] << 3) ^ state[2]) >> 11);
    state[0] ^ state[1] ^ state[2]
}

fn next_down_f32(value: f32) -> f32 {
    if value == 0.0 {
        -f32::from_bits(1)
    } else if value > 0.0 {
        f32::from_bits(value.to_bits() - 1)
    } else {
        f32::from_bits(value.to_bits() + 1)
    }
}

fn next_down_f64(value: f64) -> f64 {
    if value == 0.0 {
        -f64::from_bits(1)
    } else if value > 0.0 {
        f64::from_bits(value.to_bits() - 1)
    } else {
        f64::from_bits(value.to_bits() + 1)
    }
}

/// Largest value representable in `dtype` that is strictly below `bound`.
fn largest_below(dtype: DType, bound: f64) -> f64 {
    match dtype {
        DType::Float64 => next_down_f64(bound),
        DType::Float16 | DType::Float32 => {
            let mut below = bound as f32;
            while f64::from(below) >= bound {
                below = next_down_f32(below);
            }
            f64::from(below)
        }
        _ => dtype.coerce(bound.ceil() - 1.0),
    }
}

/// Combined Tausworthe sampling; element `i` advances generator column `i % columns`.
fn random_uniform(
    state: &ArrayD<f64>,
    shape: &TensorShape,
    minval: f64,
    maxval: f64,
) -> BridgeResult<ArrayD<f64>> {
    if state.ndim() != 2 || state.shape()[0] != 3 || state.shape()[1] == 0 {
        return Err(BridgeError::runtime(format!(
            "generator state must be (3, n), found {:?}",
            state.shape()
        )));
    }
    let mut columns = state
        .axis_iter(Axis(1))
        .map(|column| {
            let words = column.iter().map(|v| *v as u32).collect_vec();
            [words[0], words[1], words[2]]
        })
        .collect_vec();
    let width = columns.len();
    let samples = (0..shape.elem_count())
        .map(|i| {
            let bits = taus_step(&mut columns[i % width]);
            minval + (maxval - minval) * (f64::from(bits) / 4_294_967_296.0)
        })
        .collect_vec();
    ArrayD::from_shape_vec(IxDyn(&shape.dims), samples)
        .map_err(|err| BridgeError::runtime(err.to_string()))
}

impl Executable for ReferenceExecutable {
    fn run(&self, inputs: &[Buffer]) -> BridgeResult<Vec<Buffer>> {
        if inputs.len() != self.inputs.len() {
            return Err(BridgeError::runtime(format!(
                "program {} expects {} inputs, received {}",
                self.program,
                self.inputs.len(),
                inputs.len()
            )));
        }
        let mut feeds: HashMap<TensorId, &Buffer> = HashMap::with_capacity(inputs.len());
        for ((slot, bound), input) in self.inputs.iter().zip(inputs) {
            if bound.dims() != input.dims() {
                return Err(BridgeError::runtime(format!(
                    "input {} was compiled for {:?} but received {:?}",
                    slot.name(),
                    bound.dims(),
                    input.dims()
                )));
            }
            feeds.insert(slot.id(), input);
        }

        let mut values: HashMap<TensorId, ArrayD<f64>> = HashMap::with_capacity(self.plan.len());
        for step in &self.plan {
            let value = self.evaluate(step, &values, &feeds)?;
            values.insert(step.tensor.id(), value);
        }

        self.outputs
            .iter()
            .map(|(tensor, bound)| {
                let data = values
                    .get(&tensor.id())
                    .cloned()
                    .ok_or_else(|| BridgeError::runtime(format!("{} was not produced", tensor)))?;
                Ok(Buffer::new(bound.dtype(), data).on_device(self.device_id.as_deref()))
            })
            .collect()
    }
}
