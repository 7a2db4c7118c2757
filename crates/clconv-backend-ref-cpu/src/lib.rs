//! Host-emulated reference device for `clconv`.
//!
//! [`CpuDevice`] implements [`clconv::backend::spec::DeviceContext`] by interpreting the
//! `conv.*` program templates directly on the host. It exists to check the operator's dispatch
//! contracts (argument order, global ranges, filter layouts) and its caching behaviour through
//! [`CpuDevice::stats`].

pub mod device;
mod kernels;

pub use device::{CpuBuffer, CpuDevice, CpuEvent, CpuImage, CpuProgram, DeviceStats};
