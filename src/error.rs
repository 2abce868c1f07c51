use thiserror::Error;

pub type BridgeResult<T> = Result<T, BridgeError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    #[error("Function {function:?} expected {expected} inputs but received {actual}")]
    Arity {
        function: String,
        expected: usize,
        actual: usize,
    },
    #[error("Compilation of program {program:?} failed: {reason}")]
    Compilation { program: String, reason: String },
    #[error("Executable failed while running: {reason}")]
    RuntimeExecution { reason: String },
    #[error("Unsupported type {name:?}")]
    UnsupportedType { name: String },
    #[error("Operation {op:?} received invalid arguments: {reason}")]
    InvalidArgument { op: String, reason: String },
}

impl BridgeError {
    pub fn compilation(program: impl Into<String>, reason: impl Into<String>) -> Self {
        BridgeError::Compilation {
            program: program.into(),
            reason: reason.into(),
        }
    }

    pub fn runtime(reason: impl Into<String>) -> Self {
        BridgeError::RuntimeExecution {
            reason: reason.into(),
        }
    }

    pub fn unsupported(name: impl Into<String>) -> Self {
        BridgeError::UnsupportedType { name: name.into() }
    }

    pub fn invalid(op: impl Into<String>, reason: impl Into<String>) -> Self {
        BridgeError::InvalidArgument {
            op: op.into(),
            reason: reason.into(),
        }
    }
}
