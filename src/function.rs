//! Shape-keyed compilation cache.
//!
//! A [`LogicalFunction`] is defined once against shape-polymorphic placeholders. Every distinct
//! tuple of input dims seen by [`CompiledFunction::invoke`] is specialised, compiled and cached
//! exactly once; later calls with the same dims reuse the cached executable.

use std::{collections::HashMap, fmt, sync::Arc};

use crossbeam_utils::sync::ShardedLock;
use itertools::Itertools;
use log::{debug, info};

use crate::{
    config::RuntimeConfig,
    edsl::{Program, ShapeBindings, Tensor},
    error::{BridgeError, BridgeResult},
    exec::{Binding, Buffer, Compiler, Executable},
};

/// Input dims of one invocation, one entry per input slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShapeSignature(Vec<Vec<usize>>);

impl ShapeSignature {
    pub fn of(inputs: &[Buffer]) -> Self {
        ShapeSignature(inputs.iter().map(|b| b.dims().to_vec()).collect())
    }

    pub fn dims(&self) -> &[Vec<usize>] {
        &self.0
    }
}

impl From<Vec<Vec<usize>>> for ShapeSignature {
    fn from(dims: Vec<Vec<usize>>) -> Self {
        ShapeSignature(dims)
    }
}

impl fmt::Display for ShapeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shapes = self
            .0
            .iter()
            .map(|dims| format!("({})", dims.iter().join(", ")))
            .join(", ");
        write!(f, "[{}]", shapes)
    }
}

/// Inputs, outputs and variable updates of one reusable computation.
#[derive(Debug, Clone)]
pub struct LogicalFunction {
    name: String,
    inputs: Vec<Tensor>,
    outputs: Vec<Tensor>,
    updates: Vec<(Tensor, Tensor)>,
}

impl LogicalFunction {
    pub fn new(
        name: &str,
        inputs: Vec<Tensor>,
        outputs: Vec<Tensor>,
        updates: Vec<(Tensor, Tensor)>,
    ) -> BridgeResult<Self> {
        if let Some(slot) = inputs.iter().find(|slot| !slot.is_placeholder()) {
            return Err(BridgeError::invalid(
                "function",
                format!("input {} is not a placeholder", slot),
            ));
        }
        if let Some((target, _)) = updates
            .iter()
            .find(|(target, _)| target.variable_storage().is_none())
        {
            return Err(BridgeError::invalid(
                "function",
                format!("update target {} is not a variable", target),
            ));
        }
        if let Some((duplicate, _)) = updates
            .iter()
            .enumerate()
            .find(|(i, (target, _))| updates[..*i].iter().any(|(seen, _)| seen == target))
            .map(|(_, update)| update)
        {
            return Err(BridgeError::invalid(
                "function",
                format!("variable {} is updated more than once", duplicate),
            ));
        }
        Ok(LogicalFunction {
            name: name.to_string(),
            inputs,
            outputs,
            updates,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[Tensor] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Tensor] {
        &self.outputs
    }

    pub fn updates(&self) -> &[(Tensor, Tensor)] {
        &self.updates
    }

    /// Declared outputs followed by the update values.
    fn program_outputs(&self) -> Vec<Tensor> {
        self.outputs
            .iter()
            .cloned()
            .chain(self.updates.iter().map(|(_, value)| value.clone()))
            .collect()
    }
}

/// A [`LogicalFunction`] together with its executables, keyed by input shape.
///
/// The cache is append-only and unbounded. Lookup, compilation and insertion for a missing
/// signature all happen under one write lock, so each signature is compiled at most once.
pub struct CompiledFunction {
    function: LogicalFunction,
    compiler: Arc<dyn Compiler>,
    config: RuntimeConfig,
    cache: ShardedLock<HashMap<ShapeSignature, Arc<dyn Executable>>>,
}

impl CompiledFunction {
    pub fn new(
        function: LogicalFunction,
        compiler: Arc<dyn Compiler>,
        config: RuntimeConfig,
    ) -> Self {
        CompiledFunction {
            function,
            compiler,
            config,
            cache: ShardedLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        self.function.name()
    }

    pub fn function(&self) -> &LogicalFunction {
        &self.function
    }

    pub fn input_count(&self) -> usize {
        self.function.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.function.outputs.len()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.read().map(|cache| cache.len()).unwrap_or(0)
    }

    pub fn signature_of(&self, inputs: &[Buffer]) -> ShapeSignature {
        ShapeSignature::of(inputs)
    }

    pub fn is_cached(&self, signature: &ShapeSignature) -> bool {
        self.cached_executable(signature).is_some()
    }

    pub fn cached_executable(&self, signature: &ShapeSignature) -> Option<Arc<dyn Executable>> {
        self.cache.read().ok()?.get(signature).cloned()
    }

    /// Run the function, compiling an executable first if these input dims are new.
    pub fn invoke(&self, inputs: &[Buffer]) -> BridgeResult<Vec<Buffer>> {
        if inputs.len() != self.function.inputs.len() {
            return Err(BridgeError::Arity {
                function: self.function.name.clone(),
                expected: self.function.inputs.len(),
                actual: inputs.len(),
            });
        }
        let signature = self.signature_of(inputs);
        let executable = self.executable_for(&signature)?;

        let mut results = executable.run(inputs)?;
        let expected = self.function.outputs.len() + self.function.updates.len();
        if results.len() != expected {
            return Err(BridgeError::runtime(format!(
                "{} produced {} results, expected {}",
                self.function.name,
                results.len(),
                expected
            )));
        }
        let updated = results.split_off(self.function.outputs.len());
        self.apply_updates(updated)?;
        Ok(results)
    }

    fn executable_for(&self, signature: &ShapeSignature) -> BridgeResult<Arc<dyn Executable>> {
        if let Some(found) = self.cached_executable(signature) {
            debug!("{}: cache hit for {}", self.function.name, signature);
            return Ok(found);
        }

        let mut cache = self
            .cache
            .write()
            .map_err(|_| BridgeError::runtime("executable cache lock poisoned"))?;
        // another caller may have compiled this signature while we waited for the lock
        if let Some(found) = cache.get(signature) {
            debug!("{}: cache hit for {} after wait", self.function.name, signature);
            return Ok(Arc::clone(found));
        }
        debug!("{}: cache miss for {}", self.function.name, signature);
        let executable = self.compile(signature)?;
        cache.insert(signature.clone(), Arc::clone(&executable));
        Ok(executable)
    }

    fn compile(&self, signature: &ShapeSignature) -> BridgeResult<Arc<dyn Executable>> {
        let name = self.function.name.as_str();
        let mut bindings = ShapeBindings::new(name);
        for (slot, dims) in self.function.inputs.iter().zip(signature.dims()) {
            bindings.bind(slot, dims)?;
        }
        let program = Program::new(
            name,
            &self.function.inputs,
            &self.function.program_outputs(),
            &bindings,
        )?;

        for (target, value) in &self.function.updates {
            let dims = program.shape_of(value).map(|shape| shape.dims.as_slice());
            if dims != Some(target.shape().int_dims().as_slice()) {
                return Err(BridgeError::compilation(
                    name,
                    format!("update value {} does not match variable {}", value, target),
                ));
            }
        }

        let device_id = self.config.device_id();
        let make_binding = |tensor: &Tensor| -> BridgeResult<Binding> {
            let shape = program.shape_of(tensor).ok_or_else(|| {
                BridgeError::compilation(name, format!("{} is not part of the program", tensor))
            })?;
            Ok((tensor.clone(), Buffer::zeros(shape).on_device(device_id)))
        };
        let input_bindings = self
            .function
            .inputs
            .iter()
            .map(|slot| make_binding(slot))
            .collect::<BridgeResult<Vec<_>>>()?;
        let output_bindings = program
            .outputs()
            .iter()
            .map(|tensor| make_binding(tensor))
            .collect::<BridgeResult<Vec<_>>>()?;

        info!(
            "Compiling {} for {} (device {:?}, target {:?})",
            name,
            signature,
            device_id,
            self.config.target()
        );
        self.compiler.compile(
            &program,
            device_id,
            self.config.target(),
            input_bindings,
            output_bindings,
        )
    }

    /// Every variable lock is taken before any write, so a failure leaves all variables as
    /// they were.
    fn apply_updates(&self, values: Vec<Buffer>) -> BridgeResult<()> {
        let mut guards = self
            .function
            .updates
            .iter()
            .map(|(target, _)| {
                target
                    .variable_storage()
                    .ok_or_else(|| {
                        BridgeError::runtime(format!("update target {} is not a variable", target))
                    })?
                    .write()
                    .map_err(|_| {
                        BridgeError::runtime(format!("variable {} lock poisoned", target.name()))
                    })
            })
            .collect::<BridgeResult<Vec<_>>>()?;
        for ((guard, (target, _)), value) in guards
            .iter_mut()
            .zip(&self.function.updates)
            .zip(values)
        {
            **guard = value.cast(target.dtype());
        }
        debug!(
            "{}: wrote {} variable updates",
            self.function.name,
            guards.len()
        );
        Ok(())
    }
}

impl fmt::Debug for CompiledFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledFunction")
            .field("function", &self.function)
            .field("cached", &self.cache_len())
            .finish()
    }
}
