//! Device contract consumed by the convolution core.
//!
//! A [`DeviceContext`] exposes the handful of primitives the execution strategies need:
//! building a named program template with `-D` style defines, allocating buffers and 2-D
//! images, copying a buffer into an image, and enqueuing a kernel over a 3-D index space on a
//! single in-order queue. Everything else (context creation, queue ownership, allocator
//! policy) stays on the device side.

use std::fmt;

use serde::{Deserialize, Serialize};

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    Unimplemented { op: &'static str, reason: String },
    Execution { message: String },
}

impl BackendError {
    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Unimplemented { op, reason } => {
                write!(f, "{op} is not implemented: {reason}")
            }
            BackendError::Execution { message } => {
                write!(f, "backend execution failure: {message}")
            }
        }
    }
}

impl std::error::Error for BackendError {}

/// Texel component order. Filters are always packed four scalars per texel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelOrder {
    Rgba,
}

impl ChannelOrder {
    pub const fn components(self) -> usize {
        match self {
            ChannelOrder::Rgba => 4,
        }
    }
}

/// Scalar storage of a single texel component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelType {
    Float,
    HalfFloat,
}

impl ChannelType {
    pub const fn size_in_bytes(self) -> usize {
        match self {
            ChannelType::Float => 4,
            ChannelType::HalfFloat => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageFormat {
    pub order: ChannelOrder,
    pub channel_type: ChannelType,
}

impl ImageFormat {
    pub const fn rgba(channel_type: ChannelType) -> Self {
        Self {
            order: ChannelOrder::Rgba,
            channel_type,
        }
    }

    pub const fn texel_bytes(&self) -> usize {
        self.order.components() * self.channel_type.size_in_bytes()
    }
}

/// Width and height of a 2-D image, measured in texels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageExtent {
    pub width: usize,
    pub height: usize,
}

impl ImageExtent {
    pub const fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    pub const fn texel_count(&self) -> usize {
        self.width * self.height
    }
}

/// Global index space of a dispatch. Local sizes are left to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NdRange {
    dims: [usize; 3],
}

impl NdRange {
    pub const fn new(x: usize, y: usize, z: usize) -> Self {
        Self { dims: [x, y, z] }
    }

    pub const fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn work_items(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.work_items() == 0
    }
}

/// Positional kernel argument, bound in order to the program's parameter list.
pub enum KernelArg<'a, D: DeviceContext + ?Sized> {
    Buffer(&'a D::Buffer),
    Image(&'a D::Image),
    Int(i32),
}

impl<D: DeviceContext + ?Sized> KernelArg<'_, D> {
    pub fn kind(&self) -> &'static str {
        match self {
            KernelArg::Buffer(_) => "buffer",
            KernelArg::Image(_) => "image",
            KernelArg::Int(_) => "int",
        }
    }
}

impl<D: DeviceContext + ?Sized> fmt::Debug for KernelArg<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelArg::Buffer(buffer) => f.debug_tuple("Buffer").field(buffer).finish(),
            KernelArg::Image(image) => f.debug_tuple("Image").field(image).finish(),
            KernelArg::Int(value) => f.debug_tuple("Int").field(value).finish(),
        }
    }
}

/// Device context with a single in-order command queue.
///
/// Enqueue operations return as soon as the command is queued. Commands execute in submission
/// order, so a kernel reading a buffer written by a previous kernel on the same context needs no
/// extra barrier. Blocking points are [`DeviceContext::write_buffer`],
/// [`DeviceContext::read_buffer`], [`DeviceContext::wait`] and [`DeviceContext::finish`].
pub trait DeviceContext: Send + Sync {
    type Buffer: Clone + fmt::Debug + Send + Sync;
    type Image: fmt::Debug + Send + Sync;
    type Program: fmt::Debug + Send + Sync;
    type Event;

    fn device_name(&self) -> &str;

    /// Builds the program template registered under `template`, expanding `build_options`
    /// (a `-D NAME=VALUE` list) into it before compilation.
    fn build_program(&self, template: &str, build_options: &str) -> BackendResult<Self::Program>;

    fn alloc_buffer(&self, bytes: usize) -> BackendResult<Self::Buffer>;

    /// Blocking host-to-device copy into the start of `buffer`.
    fn write_buffer(&self, buffer: &Self::Buffer, bytes: &[u8]) -> BackendResult<()>;

    /// Blocking device-to-host copy of the whole buffer. Waits for queued work first.
    fn read_buffer(&self, buffer: &Self::Buffer) -> BackendResult<Vec<u8>>;

    fn create_image_2d(
        &self,
        format: ImageFormat,
        extent: ImageExtent,
    ) -> BackendResult<Self::Image>;

    fn enqueue_copy_buffer_to_image(
        &self,
        src: &Self::Buffer,
        dst: &Self::Image,
        src_offset: usize,
        region: ImageExtent,
    ) -> BackendResult<Self::Event>;

    fn enqueue_nd_range(
        &self,
        program: &Self::Program,
        global: NdRange,
        args: &[KernelArg<'_, Self>],
    ) -> BackendResult<Self::Event>;

    fn wait(&self, event: &Self::Event) -> BackendResult<()>;

    fn finish(&self) -> BackendResult<()>;
}
