//! Executable compiler and runtime.
//!
//! A [`Compiler`] lowers a shape-specialised [`Program`] into an [`Executable`] bound to
//! placeholder buffers for each input and output slot. The executable owns those bindings for
//! as long as it lives.

use std::sync::Arc;

use crate::{edsl::Program, edsl::Tensor, error::BridgeResult};

pub mod buffer;
pub mod reference;

pub use buffer::Buffer;
pub use reference::{ReferenceCompiler, ReferenceExecutable};

/// A symbolic slot paired with a buffer of the slot's concrete shape.
pub type Binding = (Tensor, Buffer);

pub trait Compiler: Send + Sync {
    fn compile(
        &self,
        program: &Program,
        device_id: Option<&str>,
        target: Option<&str>,
        input_bindings: Vec<Binding>,
        output_bindings: Vec<Binding>,
    ) -> BridgeResult<Arc<dyn Executable>>;
}

pub trait Executable: Send + Sync {
    /// Map input buffers to output buffers, one per bound output, in binding order.
    fn run(&self, inputs: &[Buffer]) -> BridgeResult<Vec<Buffer>>;
}
