use std::fmt;

use itertools::Itertools;

use crate::dtype::DType;

/// Declared shape of a symbolic tensor. `None` dims are not known until bound.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogicalShape {
    pub dtype: DType,
    pub dims: Vec<Option<usize>>,
}

/// Fully concrete shape, as carried by a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorShape {
    pub dtype: DType,
    pub dims: Vec<usize>,
}

impl LogicalShape {
    pub fn new(dtype: DType, dims: Vec<Option<usize>>) -> Self {
        LogicalShape { dtype, dims }
    }

    pub fn concrete(dtype: DType, dims: &[usize]) -> Self {
        LogicalShape {
            dtype,
            dims: dims.iter().map(|d| Some(*d)).collect(),
        }
    }

    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    /// Dims with unknown entries reported as 0.
    pub fn int_dims(&self) -> Vec<usize> {
        self.dims.iter().map(|d| d.unwrap_or(0)).collect()
    }

    /// Whether `dims` is a valid binding for this shape.
    pub fn accepts(&self, dims: &[usize]) -> bool {
        self.dims.len() == dims.len()
            && self
                .dims
                .iter()
                .zip(dims)
                .all(|(declared, bound)| declared.map_or(true, |d| d == *bound))
    }
}

impl TensorShape {
    pub fn new(dtype: DType, dims: Vec<usize>) -> Self {
        TensorShape { dtype, dims }
    }

    pub fn elem_count(&self) -> usize {
        self.dims.iter().product()
    }
}

impl fmt::Display for LogicalShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims = self
            .dims
            .iter()
            .map(|d| match d {
                Some(d) => d.to_string(),
                None => "?".to_string(),
            })
            .join(", ");
        write!(f, "{}({})", self.dtype, dims)
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.dtype, self.dims.iter().join(", "))
    }
}

/// Numpy-style broadcast of two dim lists, right aligned.
pub(crate) fn broadcast_dims(lhs: &[usize], rhs: &[usize]) -> Option<Vec<usize>> {
    let ndims = lhs.len().max(rhs.len());
    let mut out = vec![0; ndims];
    for i in 0..ndims {
        let l = if i < ndims - lhs.len() {
            1
        } else {
            lhs[i - (ndims - lhs.len())]
        };
        let r = if i < ndims - rhs.len() {
            1
        } else {
            rhs[i - (ndims - rhs.len())]
        };
        out[i] = match (l, r) {
            (l, r) if l == r => l,
            (1, r) => r,
            (l, 1) => l,
            _ => return None,
        };
    }
    Some(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn accepts_binding_with_unknown_dims() {
        let shape = LogicalShape::new(DType::Float32, vec![None, Some(4)]);
        assert!(shape.accepts(&[2, 4]));
        assert!(shape.accepts(&[9, 4]));
        assert!(!shape.accepts(&[2, 5]));
        assert!(!shape.accepts(&[2, 4, 1]));
        assert_eq!(shape.int_dims(), vec![0, 4]);
        assert_eq!(shape.to_string(), "float32(?, 4)");
    }

    #[test]
    fn broadcast() {
        assert_eq!(broadcast_dims(&[2, 4], &[4]), Some(vec![2, 4]));
        assert_eq!(broadcast_dims(&[2, 1], &[1, 3]), Some(vec![2, 3]));
        assert_eq!(broadcast_dims(&[], &[3]), Some(vec![3]));
        assert_eq!(broadcast_dims(&[2, 4], &[3]), None);
    }
}
