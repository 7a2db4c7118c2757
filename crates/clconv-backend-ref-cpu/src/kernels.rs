//! Host emulations of the convolution program templates.
//!
//! Each emulation walks the launched global range work item by work item, with the same
//! per-item tiling and bounds checks as the device programs. Channel counts and the window size
//! come from the build-time defines, everything else from the positional arguments.

use clconv::backend::spec::{BackendError, BackendResult, KernelArg, NdRange};
use clconv::kernels::{
    KernelKind, DIRECT_CHANNELS_PER_ITEM, DIRECT_COLUMNS_PER_ITEM, FILTER_DIV_G,
    GEMM1X1_CHANNELS_PER_ITEM, GEMM1X1_PIXELS_PER_ITEM, IN_CHANNEL, IN_CHANNEL_DIV_G, KERNEL,
    MEC_GEMM_CHANNELS_PER_ITEM, MEC_GEMM_COLUMNS_PER_ITEM, OUT_CHANNEL, OUT_CHANNEL_DIV_G,
};
use clconv::tensor::DType;

use crate::device::{CpuBuffer, CpuDevice, CpuImage, CpuProgram};

const TEXEL: usize = 4;

#[derive(Clone, Copy, PartialEq, Eq)]
enum ArgKind {
    Buffer,
    Image,
    Int,
}

impl ArgKind {
    fn name(self) -> &'static str {
        match self {
            ArgKind::Buffer => "buffer",
            ArgKind::Image => "image",
            ArgKind::Int => "int",
        }
    }
}

fn signature(kind: KernelKind) -> &'static [ArgKind] {
    use ArgKind::{Buffer as B, Image as M, Int as I};
    match kind {
        KernelKind::Gemm1x1 => &[B, I, B, B, I, I, I, I, I, I],
        KernelKind::MecLowering => &[B, I, I, I, I, B, I, I],
        KernelKind::MecGemm => &[B, I, M, B, I, I, I, I, I, I, B, I],
        KernelKind::Direct => &[M, B, I, I, I, I, B, I, B, I, I],
    }
}

pub(crate) fn check_signature(
    kind: KernelKind,
    args: &[KernelArg<'_, CpuDevice>],
) -> BackendResult<()> {
    let expected = signature(kind);
    debug_assert_eq!(expected.len(), kind.arity());
    if args.len() != expected.len() {
        return Err(BackendError::execution(format!(
            "{kind} takes {} arguments, got {}",
            expected.len(),
            args.len()
        )));
    }
    for (index, (arg, want)) in args.iter().zip(expected).enumerate() {
        if arg.kind() != want.name() {
            return Err(BackendError::execution(format!(
                "{kind} argument {index} must be {}, got {}",
                want.name(),
                arg.kind()
            )));
        }
    }
    Ok(())
}

struct Args<'a, 'b> {
    kind: KernelKind,
    args: &'a [KernelArg<'b, CpuDevice>],
}

impl<'a, 'b> Args<'a, 'b> {
    fn buffer(&self, index: usize) -> BackendResult<&'b CpuBuffer> {
        match self.args.get(index) {
            Some(KernelArg::Buffer(buffer)) => Ok(*buffer),
            _ => Err(self.mismatch(index, "buffer")),
        }
    }

    fn image(&self, index: usize) -> BackendResult<&'b CpuImage> {
        match self.args.get(index) {
            Some(KernelArg::Image(image)) => Ok(*image),
            _ => Err(self.mismatch(index, "image")),
        }
    }

    fn int(&self, index: usize) -> BackendResult<usize> {
        match self.args.get(index) {
            Some(KernelArg::Int(value)) => usize::try_from(*value).map_err(|_| {
                BackendError::execution(format!(
                    "{} argument {index} must be non-negative, got {value}",
                    self.kind
                ))
            }),
            _ => Err(self.mismatch(index, "int")),
        }
    }

    fn mismatch(&self, index: usize, want: &str) -> BackendError {
        BackendError::execution(format!("{} argument {index} is not a {want}", self.kind))
    }
}

fn define(program: &CpuProgram, name: &str) -> BackendResult<usize> {
    let raw = program.define(name).ok_or_else(|| {
        BackendError::execution(format!("{} was built without -D {name}", program.kind))
    })?;
    raw.parse().map_err(|_| {
        BackendError::execution(format!(
            "{}: -D {name}={raw} is not a non-negative integer",
            program.kind
        ))
    })
}

fn read(values: &[f32], index: usize, what: &str) -> BackendResult<f32> {
    values.get(index).copied().ok_or_else(|| {
        BackendError::execution(format!(
            "{what} read at {index} is out of bounds ({} elements)",
            values.len()
        ))
    })
}

fn write(values: &mut [f32], index: usize, value: f32, what: &str) -> BackendResult<()> {
    let len = values.len();
    let slot = values.get_mut(index).ok_or_else(|| {
        BackendError::execution(format!(
            "{what} write at {index} is out of bounds ({len} elements)"
        ))
    })?;
    *slot = value;
    Ok(())
}

/// RGBA texel lookup in a snapshot of `image`.
struct Texels {
    width: usize,
    height: usize,
    components: Vec<f32>,
}

impl Texels {
    fn of(image: &CpuImage) -> BackendResult<Self> {
        let extent = image.extent();
        Ok(Self {
            width: extent.width,
            height: extent.height,
            components: image.snapshot()?,
        })
    }

    fn component(&self, x: usize, y: usize, lane: usize) -> BackendResult<f32> {
        if x >= self.width || y >= self.height {
            return Err(BackendError::execution(format!(
                "image read at ({x}, {y}) outside {}x{}",
                self.width, self.height
            )));
        }
        Ok(self.components[(y * self.width + x) * TEXEL + lane])
    }
}

fn round_to(dtype: DType, value: f32) -> f32 {
    match dtype {
        DType::F32 => value,
        DType::F16 => half::f16::from_f32(value).to_f32(),
    }
}

pub(crate) fn launch(
    program: &CpuProgram,
    global: NdRange,
    args: &[KernelArg<'_, CpuDevice>],
) -> BackendResult<()> {
    let args = Args {
        kind: program.kind,
        args,
    };
    match program.kind {
        KernelKind::Gemm1x1 => gemm1x1(program, global, &args),
        KernelKind::MecLowering => mec_lowering(program, global, &args),
        KernelKind::MecGemm => mec_gemm(program, global, &args),
        KernelKind::Direct => direct(program, global, &args),
    }
}

fn gemm1x1(program: &CpuProgram, global: NdRange, args: &Args<'_, '_>) -> BackendResult<()> {
    if define(program, KERNEL)? != 1 {
        return Err(BackendError::execution("conv.gemm1x1 requires KERNEL=1"));
    }
    let in_per_group = define(program, IN_CHANNEL_DIV_G)?;
    let out_per_group = define(program, OUT_CHANNEL_DIV_G)?;
    let filter_per_group = define(program, FILTER_DIV_G)?;
    let dtype = program.dtype;

    let filter = args.buffer(0)?.load(dtype)?;
    let x = args.buffer(2)?.load(dtype)?;
    let y_buffer = args.buffer(3)?;
    let mut y = y_buffer.load(dtype)?;
    let reduction = args.int(1)?;
    let ldc = args.int(4)?;
    let m = args.int(5)?;
    let n = args.int(6)?;
    let k = args.int(7)?;
    let x_offset = args.int(8)?;
    let y_offset = args.int(9)?;
    if reduction != k {
        return Err(BackendError::execution(format!(
            "conv.gemm1x1 filter row length {reduction} disagrees with K={k}"
        )));
    }

    let [gx, gy, gz] = global.dims();
    for group in 0..gz {
        for j in 0..gy {
            for i in 0..gx {
                for mm in 0..GEMM1X1_CHANNELS_PER_ITEM {
                    let row = j * GEMM1X1_CHANNELS_PER_ITEM + mm;
                    if row >= m {
                        break;
                    }
                    for pp in 0..GEMM1X1_PIXELS_PER_ITEM {
                        let pixel = i * GEMM1X1_PIXELS_PER_ITEM + pp;
                        if pixel >= n {
                            break;
                        }
                        let mut acc = 0.0f32;
                        for kk in 0..k {
                            let w = read(
                                &filter,
                                group * filter_per_group + row * k + kk,
                                "filter",
                            )?;
                            let channel = group * in_per_group + kk;
                            let v = read(&x, x_offset + channel * n + pixel, "input")?;
                            acc += w * v;
                        }
                        let out_channel = group * out_per_group + row;
                        write(
                            &mut y,
                            y_offset + out_channel * ldc + pixel,
                            round_to(dtype, acc),
                            "output",
                        )?;
                    }
                }
            }
        }
    }
    y_buffer.store(dtype, &y)
}

fn mec_lowering(program: &CpuProgram, global: NdRange, args: &Args<'_, '_>) -> BackendResult<()> {
    let kernel = define(program, KERNEL)?;
    let in_channels = define(program, IN_CHANNEL)?;
    let dtype = program.dtype;

    let x = args.buffer(0)?.load(dtype)?;
    let in_height = args.int(1)?;
    let in_width = args.int(3)?;
    let lowered_buffer = args.buffer(5)?;
    let mut lowered = lowered_buffer.load(dtype)?;
    let stride = args.int(6)?;
    let x_offset = args.int(7)?;

    let [gx, gy, gz] = global.dims();
    for c4 in 0..gz {
        for h in 0..gy {
            for w in 0..gx {
                for kw in 0..kernel {
                    let col = w * stride + kw;
                    if col >= in_width || h >= in_height {
                        return Err(BackendError::execution(format!(
                            "conv.mec_lowering window ({h}, {col}) outside {in_height}x{in_width}"
                        )));
                    }
                    for lane in 0..TEXEL {
                        let c = c4 * TEXEL + lane;
                        let value =
                            read(&x, x_offset + (h * in_width + col) * in_channels + c, "input")?;
                        let dst = ((w * in_height + h) * kernel + kw) * in_channels + c;
                        write(&mut lowered, dst, value, "lowered")?;
                    }
                }
            }
        }
    }
    lowered_buffer.store(dtype, &lowered)
}

fn mec_gemm(program: &CpuProgram, global: NdRange, args: &Args<'_, '_>) -> BackendResult<()> {
    let kernel = define(program, KERNEL)?;
    let in_channels = define(program, IN_CHANNEL)?;
    let out_channels = define(program, OUT_CHANNEL)?;
    let dtype = program.dtype;

    let lowered = args.buffer(0)?.load(dtype)?;
    let lda = args.int(1)?;
    let filter = Texels::of(args.image(2)?)?;
    let y_buffer = args.buffer(3)?;
    let mut y = y_buffer.load(dtype)?;
    let ldc = args.int(4)?;
    let m = args.int(5)?;
    let n = args.int(6)?;
    let k = args.int(7)?;
    let row_step = args.int(9)?;
    let bias = args.buffer(10)?.load(dtype)?;
    let y_offset = args.int(11)?;
    if n != out_channels || k != kernel * kernel * in_channels {
        return Err(BackendError::execution(format!(
            "conv.mec_gemm built for C_out={out_channels}, K*K*C_in={} but launched with N={n}, K={k}",
            kernel * kernel * in_channels
        )));
    }

    let [gx, gy, gz] = global.dims();
    for ho in 0..gz {
        for j in 0..gy {
            for i in 0..gx {
                for ww in 0..MEC_GEMM_COLUMNS_PER_ITEM {
                    let w = j * MEC_GEMM_COLUMNS_PER_ITEM + ww;
                    if w >= m {
                        break;
                    }
                    for lane in 0..MEC_GEMM_CHANNELS_PER_ITEM {
                        let co = i * MEC_GEMM_CHANNELS_PER_ITEM + lane;
                        if co >= n {
                            break;
                        }
                        let mut acc = read(&bias, co, "bias")?;
                        let base = w * lda + ho * row_step;
                        for kk in 0..k {
                            let v = read(&lowered, base + kk, "lowered")?;
                            acc += v * filter.component(co / TEXEL, kk, co % TEXEL)?;
                        }
                        write(
                            &mut y,
                            y_offset + (ho * m + w) * ldc + co,
                            round_to(dtype, acc),
                            "output",
                        )?;
                    }
                }
            }
        }
    }
    y_buffer.store(dtype, &y)
}

fn direct(program: &CpuProgram, global: NdRange, args: &Args<'_, '_>) -> BackendResult<()> {
    let kernel = define(program, KERNEL)?;
    let in_channels = define(program, IN_CHANNEL)?;
    let out_channels = define(program, OUT_CHANNEL)?;
    let dtype = program.dtype;

    let filter = Texels::of(args.image(0)?)?;
    let x = args.buffer(1)?.load(dtype)?;
    let in_width = args.int(4)?;
    let out_width = args.int(5)?;
    let y_buffer = args.buffer(6)?;
    let mut y = y_buffer.load(dtype)?;
    let stride = args.int(7)?;
    let bias = args.buffer(8)?.load(dtype)?;
    let x_offset = args.int(9)?;
    let y_offset = args.int(10)?;

    let [gx, gy, gz] = global.dims();
    for ho in 0..gz {
        for j in 0..gy {
            for i in 0..gx {
                for cc in 0..DIRECT_CHANNELS_PER_ITEM {
                    let co = j * DIRECT_CHANNELS_PER_ITEM + cc;
                    for ww in 0..DIRECT_COLUMNS_PER_ITEM {
                        let w = i * DIRECT_COLUMNS_PER_ITEM + ww;
                        if w >= out_width {
                            break;
                        }
                        let mut acc = read(&bias, co, "bias")?;
                        for kh in 0..kernel {
                            for kw in 0..kernel {
                                let pixel = (ho * stride + kh) * in_width + w * stride + kw;
                                for c in 0..in_channels {
                                    let tap = (kh * kernel + kw) * in_channels + c;
                                    let v = read(&x, x_offset + pixel * in_channels + c, "input")?;
                                    acc += v * filter.component(tap / TEXEL, co, tap % TEXEL)?;
                                }
                            }
                        }
                        write(
                            &mut y,
                            y_offset + (ho * out_width + w) * out_channels + co,
                            round_to(dtype, acc),
                            "output",
                        )?;
                    }
                }
            }
        }
    }
    y_buffer.store(dtype, &y)
}
