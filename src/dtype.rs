use std::fmt;

use num_traits::NumCast;

use crate::error::{BridgeError, BridgeResult};

/// Element type of a tensor, named the way numpy names them.
///
/// `Float16` is a storage tag only. Its values are held with single precision and range, so
/// results computed in `float16` match `float32` results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Boolean,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float16,
    Float32,
    Float64,
}

impl DType {
    /// Translate a numpy-style type name. Anything unmapped is an `UnsupportedType` error.
    pub fn from_name(name: &str) -> BridgeResult<DType> {
        let dtype = match name.trim() {
            "bool" | "bool_" | "bool8" | "boolean" => DType::Boolean,
            "int8" => DType::Int8,
            "int16" => DType::Int16,
            "int32" => DType::Int32,
            "int64" => DType::Int64,
            "uint8" => DType::UInt8,
            "uint16" => DType::UInt16,
            "uint32" => DType::UInt32,
            "uint64" => DType::UInt64,
            "float16" | "half" => DType::Float16,
            "float32" | "float" => DType::Float32,
            "float64" | "double" => DType::Float64,
            other => return Err(BridgeError::unsupported(other)),
        };
        Ok(dtype)
    }

    pub fn name(&self) -> &'static str {
        match self {
            DType::Boolean => "bool",
            DType::Int8 => "int8",
            DType::Int16 => "int16",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::UInt8 => "uint8",
            DType::UInt16 => "uint16",
            DType::UInt32 => "uint32",
            DType::UInt64 => "uint64",
            DType::Float16 => "float16",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::Float16 | DType::Float32 | DType::Float64)
    }

    pub fn is_integer(&self) -> bool {
        !self.is_float() && *self != DType::Boolean
    }

    fn bit_width(&self) -> u32 {
        match self {
            DType::Boolean => 1,
            DType::Int8 | DType::UInt8 => 8,
            DType::Int16 | DType::UInt16 | DType::Float16 => 16,
            DType::Int32 | DType::UInt32 | DType::Float32 => 32,
            DType::Int64 | DType::UInt64 | DType::Float64 => 64,
        }
    }

    fn class_rank(&self) -> u8 {
        if self.is_float() {
            2
        } else if self.is_integer() {
            1
        } else {
            0
        }
    }

    /// Result type of a binary operation: floats win over integers, integers over booleans,
    /// and within a class the wider type wins.
    pub fn promote(self, other: DType) -> DType {
        let lhs = (self.class_rank(), self.bit_width());
        let rhs = (other.class_rank(), other.bit_width());
        if rhs > lhs {
            other
        } else {
            self
        }
    }

    /// Map a value into the domain of this dtype.
    ///
    /// Integers truncate toward zero and saturate at the type bounds, booleans collapse to 0/1.
    /// `Float16` is widened to single precision.
    pub fn coerce(&self, value: f64) -> f64 {
        match self {
            DType::Boolean => {
                if value != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            DType::Int8 => saturate::<i8>(value, i8::MIN as f64, i8::MAX as f64),
            DType::Int16 => saturate::<i16>(value, i16::MIN as f64, i16::MAX as f64),
            DType::Int32 => saturate::<i32>(value, i32::MIN as f64, i32::MAX as f64),
            DType::Int64 => saturate::<i64>(value, i64::MIN as f64, i64::MAX as f64),
            DType::UInt8 => saturate::<u8>(value, 0.0, u8::MAX as f64),
            DType::UInt16 => saturate::<u16>(value, 0.0, u16::MAX as f64),
            DType::UInt32 => saturate::<u32>(value, 0.0, u32::MAX as f64),
            DType::UInt64 => saturate::<u64>(value, 0.0, u64::MAX as f64),
            DType::Float16 | DType::Float32 => value as f32 as f64,
            DType::Float64 => value,
        }
    }
}

fn saturate<N: NumCast>(value: f64, min: f64, max: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    let clamped = value.trunc().max(min).min(max);
    match N::from(clamped) {
        Some(narrowed) => narrowed.to_f64().unwrap_or(clamped),
        None => clamped,
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
