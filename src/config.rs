use std::env;

use crate::{dtype::DType, error::BridgeResult};

pub const DEVICE_ID_VAR: &str = "TILE_DEVICE_ID";
pub const TARGET_VAR: &str = "TILE_TARGET";
pub const FLOATX_VAR: &str = "TILE_FLOATX";

/// Runtime selection read from the process environment.
///
/// `None` for the device or target means the runtime picks its own default.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub device_id: Option<String>,
    pub target: Option<String>,
    pub floatx: DType,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            device_id: None,
            target: None,
            floatx: DType::Float32,
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    }
}

impl RuntimeConfig {
    pub fn from_env() -> BridgeResult<Self> {
        let floatx = match non_empty_var(FLOATX_VAR) {
            Some(name) => DType::from_name(&name)?,
            None => DType::Float32,
        };
        Ok(RuntimeConfig {
            device_id: non_empty_var(DEVICE_ID_VAR),
            target: non_empty_var(TARGET_VAR),
            floatx,
        })
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }
}
