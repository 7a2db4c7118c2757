//! Keyed cache of built device programs.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::spec::{BackendError, BackendResult, DeviceContext};
use crate::kernels::KernelSpec;
use crate::profiling;

/// Cache key: template identity plus the full ordered substitution list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgramKey {
    pub template: &'static str,
    pub substitutions: Vec<(String, String)>,
}

impl ProgramKey {
    pub fn from_spec(spec: &KernelSpec) -> Self {
        Self {
            template: spec.template(),
            substitutions: spec.substitutions.clone(),
        }
    }

    pub fn fingerprint(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

pub struct CompiledProgram<D: DeviceContext> {
    pub fingerprint: u64,
    pub spec: KernelSpec,
    pub program: D::Program,
}

impl<D: DeviceContext> fmt::Debug for CompiledProgram<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledProgram")
            .field("fingerprint", &format_args!("{:016x}", self.fingerprint))
            .field("template", &self.spec.template())
            .field("program", &self.program)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgramCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

pub struct ProgramCache<D: DeviceContext> {
    compiled: Mutex<HashMap<ProgramKey, Arc<CompiledProgram<D>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<D: DeviceContext> Default for ProgramCache<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: DeviceContext> ProgramCache<D> {
    pub fn new() -> Self {
        Self {
            compiled: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the program built for `spec`, building it on first use.
    pub fn compile(&self, device: &D, spec: &KernelSpec) -> BackendResult<Arc<CompiledProgram<D>>> {
        let key = ProgramKey::from_spec(spec);
        let mut compiled = self
            .compiled
            .lock()
            .map_err(|_| BackendError::execution("program cache poisoned"))?;

        if let Some(found) = compiled.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            profiling::cache_event("clconv.program_hit");
            return Ok(Arc::clone(found));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        profiling::cache_event("clconv.program_miss");

        let fingerprint = key.fingerprint();
        let build_options = spec.build_options();
        log::debug!(
            "building {} ({fingerprint:016x}) on {} with '{build_options}'",
            spec.template(),
            device.device_name()
        );
        let program = {
            let _compile_scope = profiling::compile_scope("clconv.build_program");
            device.build_program(spec.template(), &build_options)?
        };

        let entry = Arc::new(CompiledProgram {
            fingerprint,
            spec: spec.clone(),
            program,
        });
        compiled.insert(key, Arc::clone(&entry));
        Ok(entry)
    }

    pub fn stats(&self) -> ProgramCacheStats {
        let entries = self
            .compiled
            .lock()
            .map(|compiled| compiled.len())
            .unwrap_or(0);
        ProgramCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{direct_kernel_spec, mec_gemm_kernel_spec};

    #[test]
    fn fingerprint_follows_substitutions() {
        let a = ProgramKey::from_spec(&direct_kernel_spec::<f32>(4, 4, 3));
        let b = ProgramKey::from_spec(&direct_kernel_spec::<f32>(4, 4, 3));
        let c = ProgramKey::from_spec(&direct_kernel_spec::<f32>(4, 8, 3));
        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a, c);
    }

    #[test]
    fn template_is_part_of_the_key() {
        let direct = ProgramKey::from_spec(&direct_kernel_spec::<f32>(4, 4, 3));
        let gemm = ProgramKey::from_spec(&mec_gemm_kernel_spec::<f32>(4, 4, 3));
        assert_eq!(direct.substitutions, gemm.substitutions);
        assert_ne!(direct, gemm);
    }
}
