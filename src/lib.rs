//! Keras-style backend adapter over a tensor compilation runtime.
//!
//! Computations are described symbolically through [`Backend`], wrapped with
//! [`Backend::function`] and compiled lazily: once per distinct set of input shapes.

extern crate crossbeam_utils;
extern crate ndarray;
extern crate num_traits;
extern crate rand;
extern crate thiserror;

use std::sync::Arc;

use crossbeam::sync::ShardedLock;
use env_logger::Env;

pub mod backend;
pub mod config;
pub mod dtype;
pub mod edsl;
pub mod error;
pub mod exec;
pub mod function;
#[cfg(test)]
mod tests;

pub use backend::{Backend, Node, Operand, Value};
pub use config::RuntimeConfig;
pub use dtype::DType;
pub use error::{BridgeError, BridgeResult};
pub use exec::{Buffer, Compiler, Executable, ReferenceCompiler};
pub use function::{CompiledFunction, LogicalFunction, ShapeSignature};

pub(crate) type ArcLock<T> = Arc<ShardedLock<T>>;

/// Install the `env_logger` logger, honouring `RUST_LOG` and defaulting to `info`.
///
/// Calling this more than once is harmless.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or("info")).try_init();
}
