//! Caching behaviour observed through the reference device's counters.

use std::sync::Arc;

use anyhow::{ensure, Result};
use clconv::tensor::{DeviceTensor, HostTensor, Real, Shape};
use clconv::{ConvConfig, ConvOp};
use clconv_backend_ref_cpu::{CpuDevice, DeviceStats};

fn ramp(dims: &[usize]) -> HostTensor {
    HostTensor::from_fn(Shape::new(dims.to_vec()), |idx| ((idx % 13) as f32 - 6.0) / 8.0)
}

fn nhwc_op(device: &Arc<CpuDevice>, prefer_lowering: bool) -> Result<ConvOp<CpuDevice, f32>> {
    let config = ConvConfig {
        prefer_lowering,
        ..ConvConfig::nhwc(3)
    };
    Ok(ConvOp::new(Arc::clone(device), config)?)
}

fn delta(after: DeviceStats, before: DeviceStats) -> DeviceStats {
    DeviceStats {
        program_builds: after.program_builds - before.program_builds,
        kernel_launches: after.kernel_launches - before.kernel_launches,
        buffer_allocs: after.buffer_allocs - before.buffer_allocs,
        image_creates: after.image_creates - before.image_creates,
        image_copies: after.image_copies - before.image_copies,
    }
}

#[test]
fn repeated_lowering_calls_build_once() -> Result<()> {
    let device = Arc::new(CpuDevice::new());
    let mut op = nhwc_op(&device, true)?;
    let x = DeviceTensor::from_host(device.as_ref(), &ramp(&[1, 5, 5, 4]), f32::DTYPE)?;
    let filter = ramp(&[4, 3, 3, 4]);
    let mut y = DeviceTensor::zeros(device.as_ref(), &[1, 3, 3, 4], f32::DTYPE)?;

    op.run(&x, &filter, None, &mut y)?;
    let first = device.stats();
    ensure!(first.program_builds == 2, "{first:?}");
    ensure!(first.image_creates == 1 && first.image_copies == 1, "{first:?}");

    op.run(&x, &filter, None, &mut y)?;
    op.run(&x, &filter, None, &mut y)?;
    let steady = delta(device.stats(), first);
    ensure!(
        steady
            == DeviceStats {
                kernel_launches: 4,
                ..DeviceStats::default()
            },
        "steady-state calls should only launch: {steady:?}"
    );
    Ok(())
}

#[test]
fn filter_size_change_repacks_exactly_once() -> Result<()> {
    let device = Arc::new(CpuDevice::new());
    let mut op = nhwc_op(&device, false)?;
    let x = DeviceTensor::from_host(device.as_ref(), &ramp(&[1, 5, 5, 4]), f32::DTYPE)?;
    let mut y = DeviceTensor::zeros(device.as_ref(), &[1, 3, 3, 4], f32::DTYPE)?;

    op.run(&x, &ramp(&[4, 3, 3, 4]), None, &mut y)?;
    let before = device.stats();
    op.run(&x, &ramp(&[8, 3, 3, 4]), None, &mut y)?;
    op.run(&x, &ramp(&[8, 3, 3, 4]), None, &mut y)?;
    let change = delta(device.stats(), before);
    ensure!(change.image_creates == 1, "{change:?}");
    ensure!(change.image_copies == 1, "{change:?}");
    ensure!(change.program_builds == 1, "{change:?}");
    Ok(())
}

#[test]
fn batches_launch_once_per_image() -> Result<()> {
    let device = Arc::new(CpuDevice::new());
    let mut op = ConvOp::<CpuDevice, f32>::new(Arc::clone(&device), ConvConfig::pointwise(2))?;
    let x = DeviceTensor::from_host(device.as_ref(), &ramp(&[3, 4, 2, 2]), f32::DTYPE)?;
    let mut y = DeviceTensor::zeros(device.as_ref(), &[1], f32::DTYPE)?;

    op.run(&x, &ramp(&[4, 2, 1, 1]), None, &mut y)?;
    let stats = device.stats();
    ensure!(stats.kernel_launches == 3, "{stats:?}");
    ensure!(stats.image_creates == 0, "pointwise filters stay in a buffer: {stats:?}");
    ensure!(y.dims() == [3, 4, 2, 2], "unexpected output dims {:?}", y.dims());
    Ok(())
}

#[test]
fn rejected_calls_never_reach_the_device() -> Result<()> {
    let device = Arc::new(CpuDevice::new());
    let mut op = ConvOp::<CpuDevice, f32>::new(Arc::clone(&device), ConvConfig::pointwise(4))?;
    let x = DeviceTensor::from_host(device.as_ref(), &ramp(&[1, 6, 2, 2]), f32::DTYPE)?;
    let mut y = DeviceTensor::zeros(device.as_ref(), &[1], f32::DTYPE)?;
    let before = device.stats();

    ensure!(op.run(&x, &ramp(&[4, 1, 1, 1]), None, &mut y).is_err());
    ensure!(delta(device.stats(), before) == DeviceStats::default());
    Ok(())
}
