//! Host reference math and fixtures for the conformance checks.

use anyhow::{ensure, Result};
use clconv::tensor::{HostTensor, Shape};
use rand::rngs::StdRng;
use rand::Rng;

/// Uniform values in `[-1, 1)`.
pub fn random_tensor(rng: &mut StdRng, dims: &[usize]) -> HostTensor {
    HostTensor::from_fn(Shape::new(dims.to_vec()), |_| rng.gen_range(-1.0f32..1.0))
}

/// Row-major `[m, k] x [k, n]`.
pub fn matmul(a: &HostTensor, b: &HostTensor) -> Result<HostTensor> {
    ensure!(a.rank() == 2 && b.rank() == 2, "matmul expects rank-2 operands");
    let (m, k) = (a.dim(0), a.dim(1));
    let n = b.dim(1);
    ensure!(b.dim(0) == k, "inner dims differ: {:?} x {:?}", a.dims(), b.dims());
    let (lhs, rhs) = (a.data(), b.data());
    let mut out = vec![0.0f32; m * n];
    for row in 0..m {
        for col in 0..n {
            out[row * n + col] = (0..k).map(|i| lhs[row * k + i] * rhs[i * n + col]).sum();
        }
    }
    Ok(HostTensor::from_vec(Shape::new([m, n]), out)?)
}

/// Grouped pointwise convolution over `[N, C_in, H, W]` with a `[C_out, C_in / G, 1, 1]`
/// filter.
pub fn conv1x1_nchw(input: &HostTensor, filter: &HostTensor, groups: usize) -> Result<HostTensor> {
    let [n, c_in, h, w] = dims4(input)?;
    let c_out = filter.dim(0);
    let per_group_in = c_in / groups;
    let per_group_out = c_out / groups;
    ensure!(filter.dim(1) == per_group_in, "filter channel mismatch");
    let pixels = h * w;
    let (x, f) = (input.data(), filter.data());
    let mut out = vec![0.0f32; n * c_out * pixels];
    for image in 0..n {
        for co in 0..c_out {
            let group = co / per_group_out;
            for p in 0..pixels {
                let mut acc = 0.0f32;
                for k in 0..per_group_in {
                    let ci = group * per_group_in + k;
                    acc += f[co * per_group_in + k] * x[(image * c_in + ci) * pixels + p];
                }
                out[(image * c_out + co) * pixels + p] = acc;
            }
        }
    }
    Ok(HostTensor::from_vec(Shape::new([n, c_out, h, w]), out)?)
}

/// Unpadded convolution over `[N, H, W, C_in]` with a `[C_out, K, K, C_in]` filter.
pub fn conv_nhwc(
    input: &HostTensor,
    filter: &HostTensor,
    bias: Option<&HostTensor>,
    stride: usize,
) -> Result<HostTensor> {
    let [n, h, w, c_in] = dims4(input)?;
    let [c_out, k, k2, filter_c] = dims4(filter)?;
    ensure!(
        k == k2 && filter_c == c_in,
        "filter {:?} does not fit input {:?}",
        filter.dims(),
        input.dims()
    );
    ensure!(h >= k && w >= k, "window {k} larger than input {h}x{w}");
    let h_out = (h - k) / stride + 1;
    let w_out = (w - k) / stride + 1;
    let (x, f) = (input.data(), filter.data());
    let mut out = vec![0.0f32; n * h_out * w_out * c_out];
    for image in 0..n {
        for ho in 0..h_out {
            for wo in 0..w_out {
                for co in 0..c_out {
                    let mut acc = bias.map(|b| b.data()[co]).unwrap_or(0.0);
                    for kh in 0..k {
                        for kw in 0..k {
                            let row = ho * stride + kh;
                            let col = wo * stride + kw;
                            for ci in 0..c_in {
                                let xv = x[((image * h + row) * w + col) * c_in + ci];
                                let fv = f[((co * k + kh) * k + kw) * c_in + ci];
                                acc += xv * fv;
                            }
                        }
                    }
                    out[((image * h_out + ho) * w_out + wo) * c_out + co] = acc;
                }
            }
        }
    }
    Ok(HostTensor::from_vec(
        Shape::new([n, h_out, w_out, c_out]),
        out,
    )?)
}

fn dims4(tensor: &HostTensor) -> Result<[usize; 4]> {
    ensure!(tensor.rank() == 4, "expected rank 4, got {:?}", tensor.dims());
    let d = tensor.dims();
    Ok([d[0], d[1], d[2], d[3]])
}

/// Element-wise `|a - b| <= atol + rtol * |b|`.
pub fn assert_close(actual: &HostTensor, expected: &HostTensor, atol: f32, rtol: f32) -> Result<()> {
    ensure!(
        actual.dims() == expected.dims(),
        "shape mismatch: {:?} vs {:?}",
        actual.dims(),
        expected.dims()
    );
    for (index, (a, b)) in actual.data().iter().zip(expected.data()).enumerate() {
        let diff = (a - b).abs();
        ensure!(
            diff <= atol + rtol * b.abs(),
            "element {index}: {a} vs {b} (diff {diff})"
        );
    }
    Ok(())
}
