//! Host-resident `f32` tensor used for filters, biases, and test fixtures.

use thiserror::Error;

use super::shape::Shape;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TensorError {
    #[error("tensor data length ({actual}) does not match shape {dims:?} ({expected} elements)")]
    LengthMismatch {
        dims: Vec<usize>,
        expected: usize,
        actual: usize,
    },
}

/// Row-major host tensor owned by the caller for the duration of an operator call.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    shape: Shape,
    data: Vec<f32>,
}

impl HostTensor {
    /// Constructs a tensor from raw values, validating the length against the shape.
    pub fn from_vec(shape: Shape, data: Vec<f32>) -> Result<Self, TensorError> {
        let expected = shape.num_elements();
        if data.len() != expected {
            return Err(TensorError::LengthMismatch {
                dims: shape.dims().to_vec(),
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: Shape) -> Self {
        let len = shape.num_elements();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    /// Builds a tensor by evaluating `f` at every flat index.
    pub fn from_fn(shape: Shape, f: impl FnMut(usize) -> f32) -> Self {
        let data = (0..shape.num_elements()).map(f).collect();
        Self { shape, data }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    /// Extent of axis `axis`. Panics when the axis is out of range.
    pub fn dim(&self, axis: usize) -> usize {
        self.shape.dims()[axis]
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_vec_rejects_wrong_length() {
        let err = HostTensor::from_vec(Shape::new([2, 2]), vec![1.0; 3]).unwrap_err();
        assert_eq!(
            err,
            TensorError::LengthMismatch {
                dims: vec![2, 2],
                expected: 4,
                actual: 3
            }
        );
    }

    #[test]
    fn from_fn_fills_in_flat_order() {
        let tensor = HostTensor::from_fn(Shape::new([2, 3]), |idx| idx as f32);
        assert_eq!(tensor.data(), &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(tensor.dim(1), 3);
    }
}
