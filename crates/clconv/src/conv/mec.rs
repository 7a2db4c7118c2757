//! Memory-efficient lowering followed by an image-backed GEMM (channel-minor only).
//!
//! Stage one copies every input row slab a horizontal window can touch into
//! `L[W_out, H_in, K, C_in]`, so that the reduction for output `(ho, w)` is the contiguous run
//! `L[w][ho * stride ..][..][..]` of length `K * K * C_in`. Stage two multiplies those runs by
//! the transposed filter image. Both stages go to the same in-order queue.

use crate::backend::shape_helpers::div_ceil;
use crate::backend::spec::{DeviceContext, KernelArg, NdRange};
use crate::compiler::ProgramCache;
use crate::kernels::{
    mec_gemm_kernel_spec, mec_lowering_kernel_spec, MEC_GEMM_CHANNELS_PER_ITEM,
    MEC_GEMM_COLUMNS_PER_ITEM,
};
use crate::layout::{FilterPacking, LayoutError, TEXEL_WIDTH};
use crate::profiling;
use crate::tensor::Real;

use super::resources::ConvResources;
use super::{kernel_int, ConvArgs, ConvError, ConvResult, ProblemShape};

/// Both channel counts are read and written as whole texels.
pub(crate) fn check_alignment(shape: &ProblemShape) -> ConvResult<()> {
    for (what, value) in [
        ("input channels", shape.in_channels),
        ("output channels", shape.out_channels),
    ] {
        if value % TEXEL_WIDTH != 0 {
            return Err(ConvError::Packing(LayoutError::NotTexelAligned { what, value }));
        }
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
    let lowering_spec =
        mec_lowering_kernel_spec::<T>(shape.in_channels, shape.out_channels, shape.kernel);
    let gemm_spec = mec_gemm_kernel_spec::<T>(shape.in_channels, shape.out_channels, shape.kernel);
    let lowering_program = programs.compile(device, &lowering_spec)?;
    let gemm_program = programs.compile(device, &gemm_spec)?;

    let row_len = shape.kernel * shape.in_channels;
    let lowered_len = shape.out_width * shape.in_height * row_len;
    let lowered = resources.ensure_lowering::<T>(device, lowered_len)?;
    let bias = resources.ensure_bias::<T>(device, args.bias, shape.out_channels)?;
    let filter = resources.ensure_filter::<T>(
        device,
        args.filter,
        FilterPacking::TransposedImage,
        shape.out_channels,
        shape.filter_row_len(),
    )?;
    let Some(filter_image) = filter.image.as_ref() else {
        return Err(ConvError::Packing(LayoutError::NotTexelAligned {
            what: "output channels",
            value: shape.out_channels,
        }));
    };

    let lowering_range = NdRange::new(
        shape.out_width,
        shape.in_height,
        shape.in_channels / TEXEL_WIDTH,
    );
    let gemm_range = NdRange::new(
        div_ceil(shape.out_channels, MEC_GEMM_CHANNELS_PER_ITEM),
        div_ceil(shape.out_width, MEC_GEMM_COLUMNS_PER_ITEM),
        shape.out_height,
    );

    let in_height = kernel_int(shape.in_height, "input height")?;
    let in_width = kernel_int(shape.in_width, "input width")?;
    let out_height = kernel_int(shape.out_height, "output height")?;
    let out_width = kernel_int(shape.out_width, "output width")?;
    let out_channels = kernel_int(shape.out_channels, "output channels")?;
    let stride = kernel_int(shape.stride, "stride")?;
    let lda = kernel_int(shape.in_height * row_len, "lowered row pitch")?;
    let row_step = kernel_int(shape.stride * row_len, "lowered row step")?;
    let reduction = kernel_int(shape.filter_row_len(), "reduction extent")?;

    let _scope = profiling::backend_scope("clconv.mec");
    for image in 0..shape.batch {
        let x_offset = kernel_int(image * shape.input_image_len(), "input offset")?;
        let y_offset = kernel_int(image * shape.output_image_len(), "output offset")?;

        let lowering_args: [KernelArg<'_, D>; 8] = [
            KernelArg::Buffer(args.input.buffer()),
            KernelArg::Int(in_height),
            KernelArg::Int(out_height),
            KernelArg::Int(in_width),
            KernelArg::Int(out_width),
            KernelArg::Buffer(&lowered),
            KernelArg::Int(stride),
            KernelArg::Int(x_offset),
        ];
        device.enqueue_nd_range(&lowering_program.program, lowering_range, &lowering_args)?;

        let gemm_args: [KernelArg<'_, D>; 12] = [
            KernelArg::Buffer(&lowered),
            KernelArg::Int(lda),
            KernelArg::Image(filter_image),
            KernelArg::Buffer(args.output.buffer()),
            KernelArg::Int(out_channels),
            KernelArg::Int(out_width),
            KernelArg::Int(out_channels),
            KernelArg::Int(reduction),
            KernelArg::Int(out_height),
            KernelArg::Int(row_step),
            KernelArg::Buffer(&bias),
            KernelArg::Int(y_offset),
        ];
        device.enqueue_nd_range(&gemm_program.program, gemm_range, &gemm_args)?;
    }
    Ok(())
}
