//! Sliding-window convolution over channel-minor data, reading the filter as a row image.

use crate::backend::shape_helpers::div_ceil;
use crate::backend::spec::{DeviceContext, KernelArg, NdRange};
use crate::compiler::ProgramCache;
use crate::kernels::{direct_kernel_spec, DIRECT_CHANNELS_PER_ITEM, DIRECT_COLUMNS_PER_ITEM};
use crate::layout::{FilterPacking, LayoutError, TEXEL_WIDTH};
use crate::profiling;
use crate::tensor::Real;

use super::resources::ConvResources;
use super::{kernel_int, ConvArgs, ConvError, ConvResult, ProblemShape};

pub(crate) fn check_alignment(shape: &ProblemShape) -> ConvResult<()> {
    // Each work item writes four whole output channels.
    if shape.out_channels % TEXEL_WIDTH != 0 {
        return Err(ConvError::Packing(LayoutError::NotTexelAligned {
            what: "output channels",
            value: shape.out_channels,
        }));
    }
    if shape.filter_row_len() % TEXEL_WIDTH != 0 {
        return Err(ConvError::Packing(LayoutError::NotTexelAligned {
            what: "filter row extent",
            value: shape.filter_row_len(),
        }));
    }
    Ok(())
}

/// Expects a shape that passed [`check_alignment`].
pub(crate) fn run<D: DeviceContext, T: Real>(
    device: &D,
    programs: &ProgramCache<D>,
    resources: &mut ConvResources<D>,
    args: &ConvArgs<'_, D>,
) -> ConvResult<()> {
    let shape = args.shape;
    let spec = direct_kernel_spec::<T>(shape.in_channels, shape.out_channels, shape.kernel);
    let program = programs.compile(device, &spec)?;
    let bias = resources.ensure_bias::<T>(device, args.bias, shape.out_channels)?;
    let filter = resources.ensure_filter::<T>(
        device,
        args.filter,
        FilterPacking::RowImage,
        shape.out_channels,
        shape.filter_row_len(),
    )?;
    let Some(filter_image) = filter.image.as_ref() else {
        return Err(ConvError::Packing(LayoutError::NotTexelAligned {
            what: "filter row extent",
            value: shape.filter_row_len(),
        }));
    };

    let global = NdRange::new(
        div_ceil(shape.out_width, DIRECT_COLUMNS_PER_ITEM),
        shape.out_channels / DIRECT_CHANNELS_PER_ITEM,
        shape.out_height,
    );
    let in_height = kernel_int(shape.in_height, "input height")?;
    let in_width = kernel_int(shape.in_width, "input width")?;
    let out_height = kernel_int(shape.out_height, "output height")?;
    let out_width = kernel_int(shape.out_width, "output width")?;
    let stride = kernel_int(shape.stride, "stride")?;

    let _scope = profiling::backend_scope("clconv.direct");
    for image in 0..shape.batch {
        let x_offset = kernel_int(image * shape.input_image_len(), "input offset")?;
        let y_offset = kernel_int(image * shape.output_image_len(), "output offset")?;
        let kernel_args: [KernelArg<'_, D>; 11] = [
            KernelArg::Image(filter_image),
            KernelArg::Buffer(args.input.buffer()),
            KernelArg::Int(in_height),
            KernelArg::Int(out_height),
            KernelArg::Int(in_width),
            KernelArg::Int(out_width),
            KernelArg::Buffer(args.output.buffer()),
            KernelArg::Int(stride),
            KernelArg::Buffer(&bias),
            KernelArg::Int(x_offset),
            KernelArg::Int(y_offset),
        ];
        device.enqueue_nd_range(&program.program, global, &kernel_args)?;
    }
    Ok(())
}
