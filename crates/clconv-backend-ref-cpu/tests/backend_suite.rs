use std::sync::Arc;

use clconv_backend_ref_cpu::CpuDevice;

clconv_backend_tests::define_backend_tests!(cpu_reference, || Arc::new(CpuDevice::new()));
