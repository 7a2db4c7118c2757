//! Grouped pointwise convolution over channel-major data.
//!
//! Group `g` computes `Y_g[M, HW] = F_g[M, K] x X_g[K, HW]` with `M = C_out / G` and
//! `K = C_in / G`. Each work item produces 4 pixels x 8 output channels of one group. Bias is not
//! applied on this path.

use crate::backend::shape_helpers::div_ceil;
use crate::backend::spec::{DeviceContext, KernelArg, NdRange};
use crate::compiler::ProgramCache;
use crate::kernels::{gemm1x1_kernel_spec, GEMM1X1_CHANNELS_PER_ITEM, GEMM1X1_PIXELS_PER_ITEM};
use crate::layout::FilterPacking;
use crate::profiling;
use crate::tensor::Real;

use super::resources::ConvResources;
use super::{kernel_int, ConvArgs, ConvResult};

pub(crate) fn run<D: DeviceContext, T: Real>(
    device: &D,
    programs: &ProgramCache<D>,
    resources: &mut ConvResources<D>,
    args: &ConvArgs<'_, D>,
) -> ConvResult<()> {
    let shape = args.shape;
    let k = shape.in_channels_per_group();
    let m = shape.out_channels_per_group();
    let pixels = shape.out_height * shape.out_width;
    if args.bias.is_some() {
        log::warn!("grouped 1x1 path ignores the bias operand");
    }

    let spec = gemm1x1_kernel_spec::<T>(
        k,
        m,
        args.filter.len() / shape.groups,
        shape.kernel,
    );
    let program = programs.compile(device, &spec)?;
    let filter = resources.ensure_filter::<T>(
        device,
        args.filter,
        FilterPacking::Plain,
        shape.out_channels,
        shape.filter_row_len(),
    )?;

    let global = NdRange::new(
        div_ceil(pixels, GEMM1X1_PIXELS_PER_ITEM),
        div_ceil(m, GEMM1X1_CHANNELS_PER_ITEM),
        shape.groups,
    );
    let k_arg = kernel_int(k, "input channels per group")?;
    let m_arg = kernel_int(m, "output channels per group")?;
    let pixels_arg = kernel_int(pixels, "pixels per image")?;

    let _scope = profiling::backend_scope("clconv.gemm1x1");
    for image in 0..shape.batch {
        let x_offset = kernel_int(image * shape.input_image_len(), "input offset")?;
        let y_offset = kernel_int(image * shape.output_image_len(), "output offset")?;
        let kernel_args: [KernelArg<'_, D>; 10] = [
            KernelArg::Buffer(&filter.buffer),
            KernelArg::Int(k_arg),
            KernelArg::Buffer(args.input.buffer()),
            KernelArg::Buffer(args.output.buffer()),
            KernelArg::Int(pixels_arg),
            KernelArg::Int(m_arg),
            KernelArg::Int(pixels_arg),
            KernelArg::Int(k_arg),
            KernelArg::Int(x_offset),
            KernelArg::Int(y_offset),
        ];
        device.enqueue_nd_range(&program.program, global, &kernel_args)?;
    }
    Ok(())
}
