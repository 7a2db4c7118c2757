//! Device-resident tensor handle.

use crate::backend::shape_helpers::checked_element_count_or_error;
use crate::backend::spec::{BackendError, BackendResult, DeviceContext};

use super::{DType, HostTensor, Shape};

/// Row-major tensor living in a device buffer.
pub struct DeviceTensor<D: DeviceContext> {
    dims: Vec<usize>,
    dtype: DType,
    buffer: D::Buffer,
}

impl<D: DeviceContext> Clone for DeviceTensor<D> {
    fn clone(&self) -> Self {
        Self {
            dims: self.dims.clone(),
            dtype: self.dtype,
            buffer: self.buffer.clone(),
        }
    }
}

impl<D: DeviceContext> std::fmt::Debug for DeviceTensor<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceTensor")
            .field("dims", &self.dims)
            .field("dtype", &self.dtype)
            .field("buffer", &self.buffer)
            .finish()
    }
}

impl<D: DeviceContext> DeviceTensor<D> {
    /// Allocates a zero-filled tensor.
    pub fn zeros(device: &D, dims: &[usize], dtype: DType) -> BackendResult<Self> {
        let bytes = byte_len(dims, dtype)?;
        let buffer = device.alloc_buffer(bytes)?;
        device.write_buffer(&buffer, &vec![0u8; bytes])?;
        Ok(Self {
            dims: dims.to_vec(),
            dtype,
            buffer,
        })
    }

    /// Uploads `host`, converting its `f32` values into `dtype`.
    pub fn from_host(device: &D, host: &HostTensor, dtype: DType) -> BackendResult<Self> {
        let bytes = dtype.encode(host.data());
        let buffer = device.alloc_buffer(bytes.len())?;
        device.write_buffer(&buffer, &bytes)?;
        Ok(Self {
            dims: host.dims().to_vec(),
            dtype,
            buffer,
        })
    }

    /// Drains the queue, then downloads and widens every element to `f32`.
    pub fn to_host(&self, device: &D) -> BackendResult<HostTensor> {
        device.finish()?;
        let bytes = device.read_buffer(&self.buffer)?;
        let mut values = self.dtype.decode(&bytes);
        values.truncate(self.element_count());
        HostTensor::from_vec(Shape::new(self.dims.clone()), values)
            .map_err(|err| BackendError::execution(err.to_string()))
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn dim(&self, axis: usize) -> usize {
        self.dims[axis]
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn buffer(&self) -> &D::Buffer {
        &self.buffer
    }

    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn byte_len(&self) -> usize {
        self.element_count() * self.dtype.size_in_bytes()
    }
}

fn byte_len(dims: &[usize], dtype: DType) -> BackendResult<usize> {
    let elements = checked_element_count_or_error(dims, || {
        BackendError::execution(format!("element count overflow for dims {dims:?}"))
    })?;
    elements
        .checked_mul(dtype.size_in_bytes())
        .ok_or_else(|| BackendError::execution(format!("byte length overflow for dims {dims:?}")))
}
