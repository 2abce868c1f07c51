use ndarray::{Array, ArrayD, Dimension, IxDyn};

use crate::{
    dtype::DType,
    edsl::TensorShape,
    error::{BridgeError, BridgeResult},
};

/// Concrete tensor data with a known shape and dtype.
///
/// Values are held as `f64` and always lie in the domain of `dtype`.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    dtype: DType,
    data: ArrayD<f64>,
    device_id: Option<String>,
}

impl Buffer {
    pub fn new(dtype: DType, data: ArrayD<f64>) -> Self {
        Buffer {
            dtype,
            data: data.mapv_into(|v| dtype.coerce(v)),
            device_id: None,
        }
    }

    pub fn from_array<D>(dtype: DType, data: Array<f64, D>) -> Self
    where
        D: Dimension,
    {
        Buffer::new(dtype, data.into_dyn())
    }

    pub fn from_vec(dtype: DType, dims: &[usize], values: Vec<f64>) -> BridgeResult<Self> {
        let count = values.len();
        let data = ArrayD::from_shape_vec(IxDyn(dims), values).map_err(|_| {
            BridgeError::invalid(
                "buffer",
                format!("{} values do not fill shape {:?}", count, dims),
            )
        })?;
        Ok(Buffer::new(dtype, data))
    }

    pub fn zeros(shape: &TensorShape) -> Self {
        Buffer {
            dtype: shape.dtype,
            data: ArrayD::zeros(IxDyn(&shape.dims)),
            device_id: None,
        }
    }

    pub fn on_device(mut self, device_id: Option<&str>) -> Self {
        self.device_id = device_id.map(str::to_string);
        self
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn dims(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn shape(&self) -> TensorShape {
        TensorShape::new(self.dtype, self.dims().to_vec())
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn data(&self) -> &ArrayD<f64> {
        &self.data
    }

    pub fn into_data(self) -> ArrayD<f64> {
        self.data
    }

    /// Elements in row-major order.
    pub fn to_vec(&self) -> Vec<f64> {
        self.data.iter().cloned().collect()
    }

    pub fn cast(&self, dtype: DType) -> Buffer {
        if dtype == self.dtype {
            return self.clone();
        }
        Buffer {
            dtype,
            data: self.data.mapv(|v| dtype.coerce(v)),
            device_id: self.device_id.clone(),
        }
    }
}
