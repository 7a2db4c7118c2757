//! Host and device tensor handles consumed by the convolution operator.
//!
//! Host tensors always carry `f32` data; the element type of device tensors is chosen when they
//! are materialized and is encoded/decoded through the [`Real`] trait at the host boundary.

mod device_tensor;
pub mod dtype;
mod host_tensor;
pub mod shape;

pub use device_tensor::DeviceTensor;
pub use dtype::{DType, Real};
pub use host_tensor::{HostTensor, TensorError};
pub use shape::Shape;
