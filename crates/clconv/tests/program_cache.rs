use std::sync::Arc;

use clconv::compiler::{ProgramCache, ProgramCacheStats, ProgramKey};
use clconv::kernels::{self, KernelKind, KernelSpec};
use clconv_backend_ref_cpu::CpuDevice;
use half::f16;

#[test]
fn identical_specs_share_one_build() {
    let device = CpuDevice::new();
    let cache = ProgramCache::<CpuDevice>::new();
    let spec = kernels::mec_gemm_kernel_spec::<f32>(8, 4, 3);

    let first = cache.compile(&device, &spec).expect("first build");
    let second = cache.compile(&device, &spec).expect("cached build");

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.fingerprint, ProgramKey::from_spec(&spec).fingerprint());
    assert_eq!(
        cache.stats(),
        ProgramCacheStats {
            hits: 1,
            misses: 1,
            entries: 1,
        }
    );
    assert_eq!(device.stats().program_builds, 1);
}

#[test]
fn any_substitution_change_builds_again() {
    let device = CpuDevice::new();
    let cache = ProgramCache::<CpuDevice>::new();
    let specs = [
        kernels::direct_kernel_spec::<f32>(4, 8, 3),
        kernels::direct_kernel_spec::<f32>(4, 8, 5),
        kernels::direct_kernel_spec::<f32>(4, 12, 3),
        kernels::direct_kernel_spec::<f16>(4, 8, 3),
        kernels::mec_gemm_kernel_spec::<f32>(4, 8, 3),
    ];
    for spec in &specs {
        cache.compile(&device, spec).expect("build");
    }
    for spec in &specs {
        cache.compile(&device, spec).expect("cached build");
    }

    let stats = cache.stats();
    assert_eq!(stats.misses, specs.len() as u64);
    assert_eq!(stats.hits, specs.len() as u64);
    assert_eq!(stats.entries, specs.len());
    assert_eq!(device.stats().program_builds, specs.len() as u64);
}

#[test]
fn built_program_carries_its_defines() {
    let device = CpuDevice::new();
    let cache = ProgramCache::<CpuDevice>::new();
    let spec = kernels::gemm1x1_kernel_spec::<f16>(3, 5, 15, 1);

    let compiled = cache.compile(&device, &spec).expect("build");
    assert_eq!(compiled.program.kind(), KernelKind::Gemm1x1);
    assert_eq!(compiled.program.define(kernels::REAL), Some("half"));
    assert_eq!(compiled.program.define(kernels::FILTER_DIV_G), Some("15"));
    assert_eq!(compiled.spec, spec);
}

#[test]
fn failed_builds_are_not_cached() {
    let device = CpuDevice::new();
    let cache = ProgramCache::<CpuDevice>::new();
    let mut spec = kernels::direct_kernel_spec::<f32>(4, 8, 3);
    spec.substitutions
        .retain(|(name, _)| name != kernels::OUT_CHANNEL);

    let err = cache
        .compile(&device, &spec)
        .expect_err("missing define must fail");
    assert!(err.to_string().contains(kernels::OUT_CHANNEL), "{err}");

    assert!(cache.compile(&device, &spec).is_err());
    let stats = cache.stats();
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.misses, 2);
    assert_eq!(device.stats().program_builds, 0);
}

#[test]
fn unknown_element_types_are_rejected_by_the_device() {
    let device = CpuDevice::new();
    let cache = ProgramCache::<CpuDevice>::new();
    let spec = KernelSpec {
        kind: KernelKind::MecLowering,
        substitutions: kernels::mec_lowering_kernel_spec::<f32>(4, 4, 3)
            .substitutions
            .into_iter()
            .map(|(name, value)| {
                if name == kernels::REAL {
                    (name, "double".to_string())
                } else {
                    (name, value)
                }
            })
            .collect(),
    };

    assert!(cache.compile(&device, &spec).is_err());
    assert_eq!(cache.stats().entries, 0);
}
