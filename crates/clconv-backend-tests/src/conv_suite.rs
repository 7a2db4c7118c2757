//! Device-agnostic conformance checks for the convolution operator.

use std::sync::Arc;

use anyhow::{bail, ensure, Result};
use clconv::backend::spec::DeviceContext;
use clconv::tensor::{DeviceTensor, HostTensor, Real, Shape};
use clconv::{ConvConfig, ConvError, ConvOp, ConvOutcome, Strategy};
use half::f16;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::reference::{assert_close, conv1x1_nchw, conv_nhwc, matmul, random_tensor};

const F32_TOL: f32 = 1e-4;
const F16_TOL: f32 = 3e-2;

fn placeholder_output<D: DeviceContext, T: Real>(device: &D) -> Result<DeviceTensor<D>> {
    Ok(DeviceTensor::zeros(device, &[1], T::DTYPE)?)
}

/// Runs one call on a fresh operator and downloads the result.
fn run_once<D: DeviceContext, T: Real>(
    device: &Arc<D>,
    config: ConvConfig,
    input: &HostTensor,
    filter: &HostTensor,
    bias: Option<&HostTensor>,
) -> Result<(ConvOutcome, HostTensor)> {
    let mut op = ConvOp::<D, T>::new(Arc::clone(device), config)?;
    let x = DeviceTensor::from_host(device.as_ref(), input, T::DTYPE)?;
    let mut y = placeholder_output::<D, T>(device)?;
    let outcome = op.run(&x, filter, bias, &mut y)?;
    Ok((outcome, y.to_host(device.as_ref())?))
}

fn expect_strategy(outcome: &ConvOutcome, strategy: Strategy) -> Result<()> {
    match outcome {
        ConvOutcome::Dispatched { strategy: actual } if *actual == strategy => Ok(()),
        other => bail!("expected {strategy} dispatch, got {other:?}"),
    }
}

pub fn pointwise_matches_dense_matmul<D: DeviceContext>(device: &Arc<D>) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(11);
    let input = random_tensor(&mut rng, &[1, 4, 2, 2]);
    let filter = random_tensor(&mut rng, &[4, 4, 1, 1]);

    let (outcome, output) =
        run_once::<D, f32>(device, ConvConfig::pointwise(1), &input, &filter, None)?;
    expect_strategy(&outcome, Strategy::GroupedGemm1x1)?;

    // [C_out, C_in] x [C_in, H * W]
    let weights = HostTensor::from_vec(Shape::new([4, 4]), filter.data().to_vec())?;
    let pixels = HostTensor::from_vec(Shape::new([4, 4]), input.data().to_vec())?;
    let expected = matmul(&weights, &pixels)?;
    let flat = HostTensor::from_vec(Shape::new([4, 4]), output.into_data())?;
    assert_close(&flat, &expected, F32_TOL, F32_TOL)
}

pub fn grouped_pointwise_matches_per_group_reference<D: DeviceContext>(
    device: &Arc<D>,
) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(12);
    // Partial tiles on both axes: 9 pixels and 3 output channels per group.
    let input = random_tensor(&mut rng, &[2, 4, 3, 3]);
    let filter = random_tensor(&mut rng, &[6, 2, 1, 1]);

    let (outcome, output) =
        run_once::<D, f32>(device, ConvConfig::pointwise(2), &input, &filter, None)?;
    expect_strategy(&outcome, Strategy::GroupedGemm1x1)?;
    let expected = conv1x1_nchw(&input, &filter, 2)?;
    assert_close(&output, &expected, F32_TOL, F32_TOL)
}

pub fn lowering_matches_reference<D: DeviceContext>(device: &Arc<D>) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(21);
    let input = random_tensor(&mut rng, &[1, 5, 5, 4]);
    let filter = random_tensor(&mut rng, &[4, 3, 3, 4]);
    let config = ConvConfig {
        prefer_lowering: true,
        ..ConvConfig::nhwc(3)
    };

    let (outcome, output) = run_once::<D, f32>(device, config, &input, &filter, None)?;
    expect_strategy(&outcome, Strategy::LoweringGemm)?;
    let expected = conv_nhwc(&input, &filter, None, 1)?;
    assert_close(&output, &expected, F32_TOL, F32_TOL)
}

pub fn direct_matches_reference<D: DeviceContext>(device: &Arc<D>) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(22);
    let input = random_tensor(&mut rng, &[1, 5, 5, 4]);
    let filter = random_tensor(&mut rng, &[4, 3, 3, 4]);

    let (outcome, output) =
        run_once::<D, f32>(device, ConvConfig::nhwc(3), &input, &filter, None)?;
    expect_strategy(&outcome, Strategy::Direct)?;
    let expected = conv_nhwc(&input, &filter, None, 1)?;
    assert_close(&output, &expected, F32_TOL, F32_TOL)
}

pub fn strided_batched_bias_matches_reference<D: DeviceContext>(device: &Arc<D>) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(23);
    let input = random_tensor(&mut rng, &[2, 7, 9, 4]);
    let filter = random_tensor(&mut rng, &[8, 3, 3, 4]);
    let bias = random_tensor(&mut rng, &[8]);
    let expected = conv_nhwc(&input, &filter, Some(&bias), 2)?;

    for (prefer_lowering, strategy) in [(true, Strategy::LoweringGemm), (false, Strategy::Direct)] {
        let config = ConvConfig {
            prefer_lowering,
            ..ConvConfig::nhwc(3).with_stride(2)
        };
        let (outcome, output) = run_once::<D, f32>(device, config, &input, &filter, Some(&bias))?;
        expect_strategy(&outcome, strategy)?;
        assert_close(&output, &expected, F32_TOL, F32_TOL)?;
    }
    Ok(())
}

pub fn half_precision_matches_reference<D: DeviceContext>(device: &Arc<D>) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(24);
    let input = random_tensor(&mut rng, &[1, 6, 6, 8]);
    let filter = random_tensor(&mut rng, &[4, 3, 3, 8]);
    let bias = random_tensor(&mut rng, &[4]);
    let expected = conv_nhwc(&input, &filter, Some(&bias), 1)?;

    for prefer_lowering in [true, false] {
        let config = ConvConfig {
            prefer_lowering,
            ..ConvConfig::nhwc(3)
        };
        let (outcome, output) = run_once::<D, f16>(device, config, &input, &filter, Some(&bias))?;
        ensure!(outcome.is_dispatched(), "f16 call was not dispatched");
        assert_close(&output, &expected, F16_TOL, F16_TOL)?;
    }
    Ok(())
}

pub fn repeated_calls_reuse_programs<D: DeviceContext>(device: &Arc<D>) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(31);
    let input = random_tensor(&mut rng, &[1, 5, 5, 4]);
    let filter = random_tensor(&mut rng, &[4, 3, 3, 4]);
    let config = ConvConfig {
        prefer_lowering: true,
        ..ConvConfig::nhwc(3)
    };

    let mut op = ConvOp::<D, f32>::new(Arc::clone(device), config)?;
    let x = DeviceTensor::from_host(device.as_ref(), &input, f32::DTYPE)?;
    let mut y = placeholder_output::<D, f32>(device)?;
    op.run(&x, &filter, None, &mut y)?;
    let first = op.program_stats();
    ensure!(first.misses == 2, "lowering + gemm should build two programs: {first:?}");

    for _ in 0..3 {
        op.run(&x, &filter, None, &mut y)?;
    }
    let after = op.program_stats();
    ensure!(after.misses == first.misses, "programs were rebuilt: {after:?}");
    ensure!(after.entries == 2, "unexpected cache entries: {after:?}");
    ensure!(after.hits == first.hits + 6, "expected six cache hits: {after:?}");
    Ok(())
}

pub fn filter_resize_rebuilds_once<D: DeviceContext>(device: &Arc<D>) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(32);
    let input = random_tensor(&mut rng, &[1, 5, 5, 4]);
    let small = random_tensor(&mut rng, &[4, 3, 3, 4]);
    let large = random_tensor(&mut rng, &[8, 3, 3, 4]);

    let mut op = ConvOp::<D, f32>::new(Arc::clone(device), ConvConfig::nhwc(3))?;
    let x = DeviceTensor::from_host(device.as_ref(), &input, f32::DTYPE)?;
    let mut y = placeholder_output::<D, f32>(device)?;

    op.run(&x, &small, None, &mut y)?;
    op.run(&x, &small, None, &mut y)?;
    ensure!(op.filter_rebuilds() == 1, "same-size filter was repacked");

    op.run(&x, &large, None, &mut y)?;
    ensure!(op.filter_rebuilds() == 2, "resized filter was not repacked exactly once");
    op.run(&x, &large, None, &mut y)?;
    ensure!(op.filter_rebuilds() == 2, "resized filter was repacked again");

    let expected = conv_nhwc(&input, &large, None, 1)?;
    assert_close(&y.to_host(device.as_ref())?, &expected, F32_TOL, F32_TOL)
}

pub fn unsupported_leaves_output_untouched<D: DeviceContext>(device: &Arc<D>) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(41);
    let input = random_tensor(&mut rng, &[1, 4, 5, 5]);
    let filter = random_tensor(&mut rng, &[4, 4, 3, 3]);
    let config = ConvConfig {
        kernel: [3, 3],
        ..ConvConfig::pointwise(1)
    };

    let mut op = ConvOp::<D, f32>::new(Arc::clone(device), config)?;
    let x = DeviceTensor::from_host(device.as_ref(), &input, f32::DTYPE)?;
    let sentinel = HostTensor::from_fn(Shape::new([1, 4, 3, 3]), |_| 7.0);
    let mut y = DeviceTensor::from_host(device.as_ref(), &sentinel, f32::DTYPE)?;

    let outcome = op.run(&x, &filter, None, &mut y)?;
    ensure!(
        matches!(outcome, ConvOutcome::Unsupported { .. }),
        "3x3 channel-major call should be unsupported, got {outcome:?}"
    );
    ensure!(op.program_stats().misses == 0, "unsupported call built programs");
    ensure!(y.to_host(device.as_ref())? == sentinel, "output was modified");
    Ok(())
}

pub fn group_mismatch_fails_before_device_work<D: DeviceContext>(device: &Arc<D>) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(42);
    let input = random_tensor(&mut rng, &[1, 6, 2, 2]);
    let filter = random_tensor(&mut rng, &[4, 1, 1, 1]);

    let mut op = ConvOp::<D, f32>::new(Arc::clone(device), ConvConfig::pointwise(4))?;
    let x = DeviceTensor::from_host(device.as_ref(), &input, f32::DTYPE)?;
    let mut y = placeholder_output::<D, f32>(device)?;
    match op.run(&x, &filter, None, &mut y) {
        Err(ConvError::ShapeMismatch(_)) => {}
        other => bail!("expected shape mismatch, got {other:?}"),
    }

    // Per-group filter extent must equal C_in / G.
    let mut op = ConvOp::<D, f32>::new(Arc::clone(device), ConvConfig::pointwise(2))?;
    let wrong = random_tensor(&mut rng, &[4, 2, 1, 1]);
    match op.run(&x, &wrong, None, &mut y) {
        Err(ConvError::ShapeMismatch(_)) => {}
        other => bail!("expected shape mismatch, got {other:?}"),
    }
    ensure!(op.program_stats().misses == 0, "failed call built programs");
    ensure!(op.filter_rebuilds() == 0, "failed call uploaded a filter");
    ensure!(y.dims() == [1], "failed call reallocated the output");
    Ok(())
}

pub fn unaligned_channels_are_packing_errors<D: DeviceContext>(device: &Arc<D>) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(43);
    let input = random_tensor(&mut rng, &[1, 4, 4, 3]);
    let filter = random_tensor(&mut rng, &[6, 1, 1, 3]);

    for prefer_lowering in [true, false] {
        let config = ConvConfig {
            prefer_lowering,
            ..ConvConfig::nhwc(1)
        };
        let mut op = ConvOp::<D, f32>::new(Arc::clone(device), config)?;
        let x = DeviceTensor::from_host(device.as_ref(), &input, f32::DTYPE)?;
        let sentinel = HostTensor::from_fn(Shape::new([1, 4, 4, 4]), |_| 7.0);
        let mut y = DeviceTensor::from_host(device.as_ref(), &sentinel, f32::DTYPE)?;
        match op.run(&x, &filter, None, &mut y) {
            Err(ConvError::Packing(_)) => {}
            other => bail!("expected packing error (lowering={prefer_lowering}), got {other:?}"),
        }
        ensure!(op.program_stats().misses == 0, "packing failure built programs");
        ensure!(
            y.dims() == [1, 4, 4, 4],
            "packing failure reallocated the output to {:?}",
            y.dims()
        );
        ensure!(y.to_host(device.as_ref())? == sentinel, "packing failure touched the output");
    }
    Ok(())
}

pub fn successive_calls_are_bit_identical<D: DeviceContext>(device: &Arc<D>) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(51);
    let input = random_tensor(&mut rng, &[2, 6, 6, 8]);
    let filter = random_tensor(&mut rng, &[8, 3, 3, 8]);
    let bias = random_tensor(&mut rng, &[8]);

    for prefer_lowering in [true, false] {
        let config = ConvConfig {
            prefer_lowering,
            ..ConvConfig::nhwc(3)
        };
        let mut op = ConvOp::<D, f32>::new(Arc::clone(device), config)?;
        let x = DeviceTensor::from_host(device.as_ref(), &input, f32::DTYPE)?;
        let mut y = placeholder_output::<D, f32>(device)?;
        op.run(&x, &filter, Some(&bias), &mut y)?;
        let first = y.to_host(device.as_ref())?;
        op.run(&x, &filter, Some(&bias), &mut y)?;
        let second = y.to_host(device.as_ref())?;
        let same = first
            .data()
            .iter()
            .zip(second.data())
            .all(|(a, b)| a.to_bits() == b.to_bits());
        ensure!(same, "outputs differ between calls (lowering={prefer_lowering})");
    }
    Ok(())
}

pub fn shape_change_respecializes<D: DeviceContext>(device: &Arc<D>) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(61);
    let narrow = random_tensor(&mut rng, &[1, 5, 5, 4]);
    let wide = random_tensor(&mut rng, &[1, 5, 5, 8]);
    let narrow_filter = random_tensor(&mut rng, &[4, 3, 3, 4]);
    let wide_filter = random_tensor(&mut rng, &[4, 3, 3, 8]);

    let mut op = ConvOp::<D, f32>::new(Arc::clone(device), ConvConfig::nhwc(3))?;
    let mut y = placeholder_output::<D, f32>(device)?;
    let x = DeviceTensor::from_host(device.as_ref(), &narrow, f32::DTYPE)?;
    op.run(&x, &narrow_filter, None, &mut y)?;

    let x = DeviceTensor::from_host(device.as_ref(), &wide, f32::DTYPE)?;
    op.run(&x, &wide_filter, None, &mut y)?;
    ensure!(op.program_stats().misses == 2, "new channel count should rebuild the program");
    let expected = conv_nhwc(&wide, &wide_filter, None, 1)?;
    assert_close(&y.to_host(device.as_ref())?, &expected, F32_TOL, F32_TOL)
}

pub fn strict_shape_rejects_changes<D: DeviceContext>(device: &Arc<D>) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(62);
    let narrow = random_tensor(&mut rng, &[1, 5, 5, 4]);
    let wide = random_tensor(&mut rng, &[1, 5, 5, 8]);
    let narrow_filter = random_tensor(&mut rng, &[4, 3, 3, 4]);
    let wide_filter = random_tensor(&mut rng, &[4, 3, 3, 8]);
    let config = ConvConfig {
        strict_shape: true,
        ..ConvConfig::nhwc(3)
    };

    let mut op = ConvOp::<D, f32>::new(Arc::clone(device), config)?;
    let mut y = placeholder_output::<D, f32>(device)?;
    let x = DeviceTensor::from_host(device.as_ref(), &narrow, f32::DTYPE)?;
    op.run(&x, &narrow_filter, None, &mut y)?;
    let before = y.to_host(device.as_ref())?;

    let x_wide = DeviceTensor::from_host(device.as_ref(), &wide, f32::DTYPE)?;
    match op.run(&x_wide, &wide_filter, None, &mut y) {
        Err(ConvError::ShapeChanged { previous, current }) => {
            ensure!(previous.in_channels == 4 && current.in_channels == 8);
        }
        other => bail!("expected shape change rejection, got {other:?}"),
    }
    ensure!(y.to_host(device.as_ref())? == before, "rejected call touched the output");

    // Spatial size is not part of the descriptor.
    let taller = random_tensor(&mut rng, &[1, 7, 5, 4]);
    let x_tall = DeviceTensor::from_host(device.as_ref(), &taller, f32::DTYPE)?;
    op.run(&x_tall, &narrow_filter, None, &mut y)?;
    ensure!(y.dims() == [1, 5, 3, 4], "unexpected output dims {:?}", y.dims());
    Ok(())
}

pub fn swapped_channels_repack_the_filter<D: DeviceContext>(device: &Arc<D>) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(63);
    // Both filters hold 288 elements, so only the shape change can trigger the repack.
    let narrow = random_tensor(&mut rng, &[1, 5, 5, 4]);
    let narrow_filter = random_tensor(&mut rng, &[8, 3, 3, 4]);
    let wide = random_tensor(&mut rng, &[1, 5, 5, 8]);
    let wide_filter = random_tensor(&mut rng, &[4, 3, 3, 8]);

    for prefer_lowering in [true, false] {
        let config = ConvConfig {
            prefer_lowering,
            ..ConvConfig::nhwc(3)
        };
        let mut op = ConvOp::<D, f32>::new(Arc::clone(device), config)?;
        let mut y = placeholder_output::<D, f32>(device)?;
        let x = DeviceTensor::from_host(device.as_ref(), &narrow, f32::DTYPE)?;
        op.run(&x, &narrow_filter, None, &mut y)?;

        let x = DeviceTensor::from_host(device.as_ref(), &wide, f32::DTYPE)?;
        op.run(&x, &wide_filter, None, &mut y)?;
        ensure!(
            op.filter_rebuilds() == 2,
            "swapped channels kept the old filter (lowering={prefer_lowering})"
        );
        let expected = conv_nhwc(&wide, &wide_filter, None, 1)?;
        assert_close(&y.to_host(device.as_ref())?, &expected, F32_TOL, F32_TOL)?;
    }

    let narrow = random_tensor(&mut rng, &[1, 4, 3, 3]);
    let narrow_filter = random_tensor(&mut rng, &[8, 4, 1, 1]);
    let wide = random_tensor(&mut rng, &[1, 8, 3, 3]);
    let wide_filter = random_tensor(&mut rng, &[4, 8, 1, 1]);
    let mut op = ConvOp::<D, f32>::new(Arc::clone(device), ConvConfig::pointwise(1))?;
    let mut y = placeholder_output::<D, f32>(device)?;
    let x = DeviceTensor::from_host(device.as_ref(), &narrow, f32::DTYPE)?;
    op.run(&x, &narrow_filter, None, &mut y)?;
    let x = DeviceTensor::from_host(device.as_ref(), &wide, f32::DTYPE)?;
    op.run(&x, &wide_filter, None, &mut y)?;
    let expected = conv1x1_nchw(&wide, &wide_filter, 1)?;
    assert_close(&y.to_host(device.as_ref())?, &expected, F32_TOL, F32_TOL)
}

pub fn bias_changes_take_effect<D: DeviceContext>(device: &Arc<D>) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(64);
    let input = random_tensor(&mut rng, &[1, 5, 5, 4]);
    let filter = random_tensor(&mut rng, &[4, 3, 3, 4]);
    let first_bias = random_tensor(&mut rng, &[4]);
    let second_bias = random_tensor(&mut rng, &[4]);

    for prefer_lowering in [true, false] {
        let config = ConvConfig {
            prefer_lowering,
            ..ConvConfig::nhwc(3)
        };
        let mut op = ConvOp::<D, f32>::new(Arc::clone(device), config)?;
        let x = DeviceTensor::from_host(device.as_ref(), &input, f32::DTYPE)?;
        let mut y = placeholder_output::<D, f32>(device)?;

        for bias in [Some(&first_bias), Some(&second_bias), None] {
            op.run(&x, &filter, bias, &mut y)?;
            let expected = conv_nhwc(&input, &filter, bias, 1)?;
            assert_close(&y.to_host(device.as_ref())?, &expected, F32_TOL, F32_TOL)?;
        }
    }
    Ok(())
}
