//! Convolution operator.
//!
//! [`ConvOp`] validates a call against its [`ConvConfig`], picks an execution strategy, lazily
//! builds the programs and device-resident filter that strategy needs, and enqueues the work.
//! One instance is meant to serve a single problem shape; see [`ConvConfig::strict_shape`].

mod direct;
mod gemm1x1;
mod mec;
pub(crate) mod resources;
pub mod strategy;

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::shape_helpers::{conv_output_extent, to_kernel_int};
use crate::backend::spec::{BackendError, DeviceContext};
use crate::compiler::{ProgramCache, ProgramCacheStats};
use crate::env;
use crate::layout::LayoutError;
use crate::profiling;
use crate::tensor::{DeviceTensor, HostTensor, Real};

use resources::ConvResources;
pub use strategy::{select_strategy, Selection, Strategy, DEFAULT_LOWERING_CHANNEL_THRESHOLD};

pub type ConvResult<T> = Result<T, ConvError>;

#[derive(Debug, Error)]
pub enum ConvError {
    #[error("invalid convolution config: {0}")]
    Config(String),
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("filter packing failed: {0}")]
    Packing(#[from] LayoutError),
    #[error("problem shape changed from {previous} to {current}")]
    ShapeChanged {
        previous: ShapeDescriptor,
        current: ShapeDescriptor,
    },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Memory order of the input and output feature maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageOrder {
    /// `[N, C, H, W]`; filters are `[C_out, C_in / G, K, K]`.
    #[default]
    Nchw,
    /// `[N, H, W, C]`; filters are `[C_out, K, K, C_in]`.
    Nhwc,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Padding2d {
    pub top: usize,
    pub bottom: usize,
    pub left: usize,
    pub right: usize,
}

impl Padding2d {
    pub fn is_zero(&self) -> bool {
        self.top == 0 && self.bottom == 0 && self.left == 0 && self.right == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvConfig {
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub dilation: [usize; 2],
    pub padding: Padding2d,
    pub groups: usize,
    pub order: StorageOrder,
    /// Force lowering + GEMM for channel-minor problems regardless of the channel count.
    pub prefer_lowering: bool,
    pub lowering_channel_threshold: usize,
    /// Reject calls whose (C_in, C_out, K, G) differs from the first dispatched call instead of
    /// recompiling for the new shape.
    pub strict_shape: bool,
}

impl Default for ConvConfig {
    fn default() -> Self {
        Self {
            kernel: [1, 1],
            stride: [1, 1],
            dilation: [1, 1],
            padding: Padding2d::default(),
            groups: 1,
            order: StorageOrder::Nchw,
            prefer_lowering: false,
            lowering_channel_threshold: DEFAULT_LOWERING_CHANNEL_THRESHOLD,
            strict_shape: false,
        }
    }
}

impl ConvConfig {
    /// Channel-major pointwise convolution split into `groups`.
    pub fn pointwise(groups: usize) -> Self {
        Self {
            groups,
            ..Self::default()
        }
    }

    /// Channel-minor convolution with a square `kernel`.
    pub fn nhwc(kernel: usize) -> Self {
        Self {
            kernel: [kernel, kernel],
            order: StorageOrder::Nhwc,
            ..Self::default()
        }
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = [stride, stride];
        self
    }

    pub fn from_json(text: &str) -> ConvResult<Self> {
        serde_json::from_str(text).map_err(|err| ConvError::Config(err.to_string()))
    }

    pub fn validate(&self) -> ConvResult<()> {
        let [kh, kw] = self.kernel;
        if kh != kw {
            return Err(ConvError::Config(format!(
                "kernel must be square, got {kh}x{kw}"
            )));
        }
        if kh == 0 {
            return Err(ConvError::Config("kernel size must be > 0".into()));
        }
        let [sh, sw] = self.stride;
        if sh == 0 || sw == 0 {
            return Err(ConvError::Config("stride must be > 0".into()));
        }
        if sh != sw {
            return Err(ConvError::Config(format!(
                "stride must match on both axes, got {sh}x{sw}"
            )));
        }
        if self.dilation != [1, 1] {
            return Err(ConvError::Config(format!(
                "dilation {:?} is not supported",
                self.dilation
            )));
        }
        if !self.padding.is_zero() {
            return Err(ConvError::Config(format!(
                "padding {:?} is not supported",
                self.padding
            )));
        }
        if self.groups == 0 {
            return Err(ConvError::Config("groups must be > 0".into()));
        }
        if self.groups > 1 && self.order == StorageOrder::Nhwc {
            return Err(ConvError::Config(format!(
                "grouped convolution (groups={}) requires channel-major order",
                self.groups
            )));
        }
        Ok(())
    }
}

/// The part of a problem shape that is baked into compiled programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShapeDescriptor {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub groups: usize,
}

impl fmt::Display for ShapeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(C_in={}, C_out={}, K={}, G={})",
            self.in_channels, self.out_channels, self.kernel, self.groups
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProblemShape {
    pub batch: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub in_height: usize,
    pub in_width: usize,
    pub out_height: usize,
    pub out_width: usize,
    pub kernel: usize,
    pub stride: usize,
    pub groups: usize,
    pub order: StorageOrder,
}

impl ProblemShape {
    pub fn descriptor(&self) -> ShapeDescriptor {
        ShapeDescriptor {
            in_channels: self.in_channels,
            out_channels: self.out_channels,
            kernel: self.kernel,
            groups: self.groups,
        }
    }

    pub fn in_channels_per_group(&self) -> usize {
        self.in_channels / self.groups
    }

    pub fn out_channels_per_group(&self) -> usize {
        self.out_channels / self.groups
    }

    /// Filter reduction extent per output channel.
    pub fn filter_row_len(&self) -> usize {
        self.in_channels_per_group() * self.kernel * self.kernel
    }

    pub fn input_image_len(&self) -> usize {
        self.in_channels * self.in_height * self.in_width
    }

    pub fn output_image_len(&self) -> usize {
        self.out_channels * self.out_height * self.out_width
    }

    pub fn output_dims(&self) -> Vec<usize> {
        match self.order {
            StorageOrder::Nchw => vec![
                self.batch,
                self.out_channels,
                self.out_height,
                self.out_width,
            ],
            StorageOrder::Nhwc => vec![
                self.batch,
                self.out_height,
                self.out_width,
                self.out_channels,
            ],
        }
    }

    fn flops(&self) -> u64 {
        (2 * self.batch * self.output_image_len() * self.filter_row_len()) as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvOutcome {
    /// Work for every image of the batch was enqueued.
    Dispatched { strategy: Strategy },
    /// Nothing was enqueued and the output was left untouched.
    Unsupported { reason: String },
}

impl ConvOutcome {
    pub fn is_dispatched(&self) -> bool {
        matches!(self, ConvOutcome::Dispatched { .. })
    }
}

/// Borrowed operands of one call, shared by the strategy implementations.
pub(crate) struct ConvArgs<'a, D: DeviceContext> {
    pub shape: &'a ProblemShape,
    pub input: &'a DeviceTensor<D>,
    pub filter: &'a HostTensor,
    pub bias: Option<&'a HostTensor>,
    pub output: &'a DeviceTensor<D>,
}

pub(crate) fn kernel_int(value: usize, what: &str) -> ConvResult<i32> {
    to_kernel_int(value, || {
        ConvError::ShapeMismatch(format!("{what} ({value}) exceeds the kernel integer range"))
    })
}

pub struct ConvOp<D: DeviceContext, T: Real> {
    device: Arc<D>,
    config: ConvConfig,
    prefer_lowering: bool,
    lowering_threshold: usize,
    programs: ProgramCache<D>,
    resources: ConvResources<D>,
    descriptor: Option<ShapeDescriptor>,
    _element: PhantomData<fn() -> T>,
}

impl<D: DeviceContext, T: Real> ConvOp<D, T> {
    pub fn new(device: Arc<D>, config: ConvConfig) -> ConvResult<Self> {
        config.validate()?;
        let prefer_lowering = env::prefer_lowering_override().unwrap_or(config.prefer_lowering);
        let lowering_threshold =
            env::lowering_threshold_override().unwrap_or(config.lowering_channel_threshold);
        Ok(Self {
            device,
            config,
            prefer_lowering,
            lowering_threshold,
            programs: ProgramCache::new(),
            resources: ConvResources::default(),
            descriptor: None,
            _element: PhantomData,
        })
    }

    pub fn config(&self) -> &ConvConfig {
        &self.config
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn program_stats(&self) -> ProgramCacheStats {
        self.programs.stats()
    }

    /// Number of times the device filter has been (re)packed and uploaded.
    pub fn filter_rebuilds(&self) -> u64 {
        self.resources.filter_rebuilds()
    }

    /// Strategy a call with `in_channels` input channels would take.
    pub fn select(&self, in_channels: usize) -> Selection {
        select_strategy(
            self.config.order,
            self.config.kernel[0],
            self.config.stride[0],
            in_channels,
            self.prefer_lowering,
            self.lowering_threshold,
        )
    }

    /// Validates the operands and derives the problem shape without touching the device.
    pub fn problem_shape(
        &self,
        input: &DeviceTensor<D>,
        filter: &HostTensor,
        bias: Option<&HostTensor>,
    ) -> ConvResult<ProblemShape> {
        if input.rank() != 4 {
            return Err(ConvError::ShapeMismatch(format!(
                "input must be rank 4, got {:?}",
                input.dims()
            )));
        }
        if input.dtype() != T::DTYPE {
            return Err(ConvError::ShapeMismatch(format!(
                "input dtype {} does not match operator dtype {}",
                input.dtype(),
                T::DTYPE
            )));
        }
        if filter.rank() != 4 {
            return Err(ConvError::ShapeMismatch(format!(
                "filter must be rank 4, got {:?}",
                filter.dims()
            )));
        }

        let kernel = self.config.kernel[0];
        let stride = self.config.stride[0];
        let groups = self.config.groups;
        let order = self.config.order;
        let dims = input.dims();
        let (batch, in_channels, in_height, in_width) = match order {
            StorageOrder::Nchw => (dims[0], dims[1], dims[2], dims[3]),
            StorageOrder::Nhwc => (dims[0], dims[3], dims[1], dims[2]),
        };
        let out_channels = filter.dim(0);

        if in_channels % groups != 0 {
            return Err(ConvError::ShapeMismatch(format!(
                "input channels ({in_channels}) are not divisible by groups ({groups})"
            )));
        }
        if out_channels % groups != 0 {
            return Err(ConvError::ShapeMismatch(format!(
                "output channels ({out_channels}) are not divisible by groups ({groups})"
            )));
        }
        let (filter_channels, filter_kernel) = match order {
            StorageOrder::Nchw => (filter.dim(1), [filter.dim(2), filter.dim(3)]),
            StorageOrder::Nhwc => (filter.dim(3), [filter.dim(1), filter.dim(2)]),
        };
        if filter_channels != in_channels / groups {
            return Err(ConvError::ShapeMismatch(format!(
                "filter {:?} expects {} input channels per group, input has {} / {}",
                filter.dims(),
                filter_channels,
                in_channels,
                groups
            )));
        }
        if filter_kernel != self.config.kernel {
            return Err(ConvError::ShapeMismatch(format!(
                "filter window {filter_kernel:?} does not match configured kernel {:?}",
                self.config.kernel
            )));
        }
        if let Some(bias) = bias {
            if bias.len() != out_channels {
                return Err(ConvError::ShapeMismatch(format!(
                    "bias has {} elements, expected {out_channels}",
                    bias.len()
                )));
            }
        }

        let extent = |input: usize, axis: &str| {
            conv_output_extent(input, kernel, stride, 1, 0, 0).ok_or_else(|| {
                ConvError::ShapeMismatch(format!(
                    "kernel {kernel} does not fit input {axis} {input}"
                ))
            })
        };
        let out_height = extent(in_height, "height")?;
        let out_width = extent(in_width, "width")?;

        Ok(ProblemShape {
            batch,
            in_channels,
            out_channels,
            in_height,
            in_width,
            out_height,
            out_width,
            kernel,
            stride,
            groups,
            order,
        })
    }

    /// Runs the convolution into `output`, reallocating it when its dims or dtype differ from
    /// the problem's. Work is enqueued only; read the output to synchronize.
    pub fn run(
        &mut self,
        input: &DeviceTensor<D>,
        filter: &HostTensor,
        bias: Option<&HostTensor>,
        output: &mut DeviceTensor<D>,
    ) -> ConvResult<ConvOutcome> {
        let shape = self.problem_shape(input, filter, bias)?;
        let current = shape.descriptor();
        let changed = match self.descriptor {
            Some(previous) if previous != current => {
                if self.config.strict_shape {
                    return Err(ConvError::ShapeChanged { previous, current });
                }
                log::debug!("conv shape changed from {previous} to {current}, respecializing");
                true
            }
            _ => false,
        };

        let strategy = match self.select(shape.in_channels) {
            Selection::Run(strategy) => strategy,
            Selection::Unsupported { reason } => {
                log::warn!("conv not dispatched: {reason}");
                return Ok(ConvOutcome::Unsupported { reason });
            }
        };
        match strategy {
            Strategy::GroupedGemm1x1 => {}
            Strategy::LoweringGemm => mec::check_alignment(&shape)?,
            Strategy::Direct => direct::check_alignment(&shape)?,
        }
        if changed {
            self.resources.invalidate();
        }

        let out_dims = shape.output_dims();
        if output.dims() != out_dims.as_slice() || output.dtype() != T::DTYPE {
            *output = DeviceTensor::zeros(self.device.as_ref(), &out_dims, T::DTYPE)?;
        }

        let _scope = profiling::backend_scope_with_work(
            "clconv.conv",
            profiling::WorkStats {
                elements: (shape.batch * shape.output_image_len()) as u64,
                bytes_written: output.byte_len() as u64,
                flops: shape.flops(),
            },
        );
        let args = ConvArgs {
            shape: &shape,
            input,
            filter,
            bias,
            output: &*output,
        };
        let device = self.device.as_ref();
        match strategy {
            Strategy::GroupedGemm1x1 => {
                gemm1x1::run::<D, T>(device, &self.programs, &mut self.resources, &args)?
            }
            Strategy::LoweringGemm => {
                mec::run::<D, T>(device, &self.programs, &mut self.resources, &args)?
            }
            Strategy::Direct => {
                direct::run::<D, T>(device, &self.programs, &mut self.resources, &args)?
            }
        }
        self.descriptor = Some(current);
        Ok(ConvOutcome::Dispatched { strategy })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid_pointwise() {
        let config = ConvConfig::default();
        config.validate().expect("default config");
        assert_eq!(config.kernel, [1, 1]);
        assert_eq!(config.order, StorageOrder::Nchw);
        assert_eq!(
            config.lowering_channel_threshold,
            DEFAULT_LOWERING_CHANNEL_THRESHOLD
        );
    }

    #[test]
    fn config_rejects_unsupported_geometry() {
        let cases = [
            ConvConfig {
                kernel: [3, 1],
                ..ConvConfig::nhwc(3)
            },
            ConvConfig::nhwc(0),
            ConvConfig::nhwc(3).with_stride(0),
            ConvConfig {
                stride: [1, 2],
                ..ConvConfig::nhwc(3)
            },
            ConvConfig {
                dilation: [2, 2],
                ..ConvConfig::nhwc(3)
            },
            ConvConfig {
                padding: Padding2d {
                    top: 1,
                    ..Padding2d::default()
                },
                ..ConvConfig::nhwc(3)
            },
            ConvConfig::pointwise(0),
            ConvConfig {
                groups: 2,
                ..ConvConfig::nhwc(1)
            },
        ];
        for config in cases {
            let err = config.validate().expect_err("config should be rejected");
            assert!(matches!(err, ConvError::Config(_)), "{config:?}: {err}");
        }
    }

    #[test]
    fn config_loads_from_json_with_defaults() {
        let config = ConvConfig::from_json(
            r#"{ "kernel": [3, 3], "order": "nhwc", "prefer_lowering": true }"#,
        )
        .expect("parse");
        assert_eq!(config.kernel, [3, 3]);
        assert_eq!(config.stride, [1, 1]);
        assert_eq!(config.order, StorageOrder::Nhwc);
        assert!(config.prefer_lowering);
        assert!(!config.strict_shape);
    }

    #[test]
    fn config_json_errors_are_config_errors() {
        let err = ConvConfig::from_json(r#"{ "order": "chwn" }"#).expect_err("bad order");
        assert!(matches!(err, ConvError::Config(_)));
    }

    #[test]
    fn output_dims_follow_storage_order() {
        let shape = ProblemShape {
            batch: 2,
            in_channels: 4,
            out_channels: 8,
            in_height: 5,
            in_width: 6,
            out_height: 3,
            out_width: 4,
            kernel: 3,
            stride: 1,
            groups: 1,
            order: StorageOrder::Nhwc,
        };
        assert_eq!(shape.output_dims(), vec![2, 3, 4, 8]);
        let nchw = ProblemShape {
            order: StorageOrder::Nchw,
            ..shape
        };
        assert_eq!(nchw.output_dims(), vec![2, 8, 3, 4]);
        assert_eq!(shape.filter_row_len(), 36);
    }

    #[test]
    fn descriptor_display_names_channels() {
        let descriptor = ShapeDescriptor {
            in_channels: 4,
            out_channels: 8,
            kernel: 3,
            groups: 1,
        };
        assert_eq!(descriptor.to_string(), "(C_in=4, C_out=8, K=3, G=1)");
    }
}
