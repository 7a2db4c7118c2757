//! Convolution execution engine for image-capable accelerator backends.
//!
//! The crate is organised around a device seam ([`backend::spec::DeviceContext`]) and an
//! operator ([`conv::ConvOp`]) that drives it:
//! - [`compiler`] caches device programs keyed by template and build-time substitutions.
//! - [`layout`] rearranges host filters into the buffer or image layouts the programs read.
//! - [`conv`] validates calls, selects an execution strategy and enqueues the work.
//! - [`profiling`] collects scope timings and cache counters behind the `profiler` feature.

pub mod backend;
pub mod compiler;
pub mod conv;
mod env;
pub mod kernels;
pub mod layout;
pub mod profiling;
pub mod tensor;

pub use conv::{
    ConvConfig, ConvError, ConvOp, ConvOutcome, ConvResult, Padding2d, ProblemShape, Strategy,
    StorageOrder,
};
pub use tensor::{DType, DeviceTensor, HostTensor, Real, Shape};
