#![cfg(feature = "profiler")]

use std::sync::{Arc, Mutex};

use clconv::profiling;
use clconv::tensor::{DeviceTensor, HostTensor, Real, Shape};
use clconv::{ConvConfig, ConvOp};
use clconv_backend_ref_cpu::CpuDevice;

static PROFILER_TEST_MUTEX: Mutex<()> = Mutex::new(());

fn ramp(dims: &[usize]) -> HostTensor {
    HostTensor::from_fn(Shape::new(dims.to_vec()), |idx| (idx % 7) as f32 * 0.25)
}

fn run_lowering_twice() {
    let device = Arc::new(CpuDevice::new());
    let config = ConvConfig {
        prefer_lowering: true,
        ..ConvConfig::nhwc(3)
    };
    let mut op = ConvOp::<CpuDevice, f32>::new(Arc::clone(&device), config).expect("op");
    let x = DeviceTensor::from_host(device.as_ref(), &ramp(&[1, 6, 6, 4]), f32::DTYPE)
        .expect("input upload");
    let filter = ramp(&[8, 3, 3, 4]);
    let mut y = DeviceTensor::zeros(device.as_ref(), &[1], f32::DTYPE).expect("output");

    for _ in 0..2 {
        let outcome = op.run(&x, &filter, None, &mut y).expect("conv");
        assert!(outcome.is_dispatched());
    }
}

#[test]
fn cache_events_track_program_and_resource_reuse() {
    let _lock = PROFILER_TEST_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    profiling::reset();

    run_lowering_twice();

    assert_eq!(profiling::cache_event_count("clconv.program_miss"), 2);
    assert_eq!(profiling::cache_event_count("clconv.program_hit"), 2);
    assert_eq!(profiling::cache_event_count("clconv.filter_rebuild"), 1);
    assert_eq!(profiling::cache_event_count("clconv.filter_hit"), 1);
    assert_eq!(profiling::cache_event_count("clconv.lowering_rebuild"), 1);
    assert_eq!(profiling::cache_event_count("clconv.lowering_hit"), 1);

    profiling::reset();
    assert_eq!(profiling::cache_event_count("clconv.program_miss"), 0);
}

#[test]
fn report_groups_scopes_by_table() {
    let _lock = PROFILER_TEST_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    profiling::reset();

    run_lowering_twice();

    let report = profiling::take_report().expect("expected profiler report");
    let conv = report
        .backend
        .iter()
        .find(|row| row.name == "clconv.conv")
        .expect("expected conv scope row");
    assert_eq!(conv.calls, 2);
    // 4x4 output pixels, 8 channels, 2 flops per multiply-add over a 3x3x4 window.
    assert_eq!(conv.elements, 2 * 4 * 4 * 8);
    assert_eq!(conv.flops, 2 * (2 * 4 * 4 * 8 * 36));
    assert!(conv.incl_ms >= conv.excl_ms);

    let mec = report
        .backend
        .iter()
        .find(|row| row.name == "clconv.mec")
        .expect("expected strategy scope row");
    assert_eq!(mec.calls, 2);

    let builds = report
        .compilation
        .iter()
        .find(|row| row.name == "clconv.build_program")
        .expect("expected build row");
    assert_eq!(builds.calls, 2);

    assert!(report
        .caches
        .iter()
        .any(|row| row.name == "clconv.program_hit" && row.calls == 2));

    assert!(
        profiling::take_report().is_none(),
        "taking a report drains the profiler"
    );
}

#[test]
fn json_report_is_parseable() {
    let _lock = PROFILER_TEST_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    profiling::reset();

    run_lowering_twice();

    let json = profiling::take_report_json().expect("expected json report");
    let value: serde_json::Value = serde_json::from_str(&json).expect("valid json");
    for table in ["backend", "compilation", "caches"] {
        assert!(value[table].is_array(), "missing table {table}");
    }
}
