//! Scope timers and cache counters for the convolution core.
//!
//! Everything here compiles to no-ops unless the `profiler` feature is enabled. Scopes nest per
//! thread; a scope's exclusive time excludes the time spent in child scopes.

#[cfg(feature = "profiler")]
use std::cell::RefCell;
#[cfg(feature = "profiler")]
use std::collections::HashMap;
#[cfg(feature = "profiler")]
use std::sync::{Mutex, OnceLock};
#[cfg(feature = "profiler")]
use std::time::{Duration, Instant};

use serde::Serialize;

#[cfg_attr(not(feature = "profiler"), allow(dead_code))]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum ProfilerKey {
    Backend { name: &'static str },
    Compile { name: &'static str },
    Cache { name: &'static str },
}

#[cfg_attr(not(feature = "profiler"), allow(dead_code))]
#[derive(Default, Clone, Copy)]
pub struct WorkStats {
    pub elements: u64,
    pub bytes_written: u64,
    pub flops: u64,
}

#[cfg(feature = "profiler")]
#[derive(Default, Clone)]
struct Stat {
    calls: u64,
    exclusive_ns: u128,
    inclusive_ns: u128,
    work: WorkStats,
}

#[cfg(feature = "profiler")]
struct Profiler {
    stats: Mutex<HashMap<ProfilerKey, Stat>>,
}

#[cfg(feature = "profiler")]
impl Profiler {
    fn instance() -> &'static Self {
        static INSTANCE: OnceLock<Profiler> = OnceLock::new();
        INSTANCE.get_or_init(|| Profiler {
            stats: Mutex::new(HashMap::new()),
        })
    }

    fn record(&self, key: ProfilerKey, exclusive: Duration, inclusive: Duration, work: WorkStats) {
        let mut stats = self.stats.lock().expect("profiler mutex poisoned");
        let entry = stats.entry(key).or_default();
        entry.calls = entry.calls.saturating_add(1);
        entry.exclusive_ns = entry.exclusive_ns.saturating_add(exclusive.as_nanos());
        entry.inclusive_ns = entry.inclusive_ns.saturating_add(inclusive.as_nanos());
        entry.work.elements = entry.work.elements.saturating_add(work.elements);
        entry.work.bytes_written = entry.work.bytes_written.saturating_add(work.bytes_written);
        entry.work.flops = entry.work.flops.saturating_add(work.flops);
    }

    fn reset(&self) {
        self.stats.lock().expect("profiler mutex poisoned").clear();
    }

    fn take_stats(&self) -> HashMap<ProfilerKey, Stat> {
        let mut stats = self.stats.lock().expect("profiler mutex poisoned");
        std::mem::take(&mut *stats)
    }

    fn calls(&self, key: ProfilerKey) -> u64 {
        self.stats
            .lock()
            .expect("profiler mutex poisoned")
            .get(&key)
            .map(|stat| stat.calls)
            .unwrap_or(0)
    }
}

#[cfg(feature = "profiler")]
struct GuardFrame {
    key: ProfilerKey,
    start: Instant,
    child_time: Duration,
    work: WorkStats,
}

#[cfg(feature = "profiler")]
thread_local! {
    static ACTIVE_GUARDS: RefCell<Vec<GuardFrame>> = const { RefCell::new(Vec::new()) };
}

pub struct ScopeGuard {
    #[cfg(feature = "profiler")]
    key: ProfilerKey,
}

impl ScopeGuard {
    #[inline(always)]
    fn new(key: ProfilerKey, work: WorkStats) -> Self {
        #[cfg(feature = "profiler")]
        {
            ACTIVE_GUARDS.with(|stack| {
                stack.borrow_mut().push(GuardFrame {
                    key,
                    start: Instant::now(),
                    child_time: Duration::ZERO,
                    work,
                });
            });
            ScopeGuard { key }
        }
        #[cfg(not(feature = "profiler"))]
        {
            let _ = key;
            let _ = work;
            ScopeGuard {}
        }
    }
}

#[cfg(feature = "profiler")]
impl Drop for ScopeGuard {
    fn drop(&mut self) {
        ACTIVE_GUARDS.with(|stack| {
            let mut stack = stack.borrow_mut();
            let frame = stack.pop().expect("scope guard stack underflow");
            debug_assert!(frame.key == self.key, "scope guard stack corrupted");

            let elapsed = frame.start.elapsed();
            let exclusive = elapsed.saturating_sub(frame.child_time);
            Profiler::instance().record(frame.key, exclusive, elapsed, frame.work);

            if let Some(parent) = stack.last_mut() {
                parent.child_time = parent.child_time.saturating_add(elapsed);
            }
        });
    }
}

#[inline(always)]
pub fn backend_scope(name: &'static str) -> ScopeGuard {
    ScopeGuard::new(ProfilerKey::Backend { name }, WorkStats::default())
}

#[inline(always)]
pub fn backend_scope_with_work(name: &'static str, work: WorkStats) -> ScopeGuard {
    ScopeGuard::new(ProfilerKey::Backend { name }, work)
}

#[inline(always)]
pub fn compile_scope(name: &'static str) -> ScopeGuard {
    ScopeGuard::new(ProfilerKey::Compile { name }, WorkStats::default())
}

#[inline(always)]
pub fn cache_event(name: &'static str) {
    #[cfg(feature = "profiler")]
    {
        Profiler::instance().record(
            ProfilerKey::Cache { name },
            Duration::ZERO,
            Duration::ZERO,
            WorkStats::default(),
        );
    }
    #[cfg(not(feature = "profiler"))]
    {
        let _ = name;
    }
}

/// Number of times `cache_event(name)` fired since the last reset or report.
#[cfg(feature = "profiler")]
pub fn cache_event_count(name: &'static str) -> u64 {
    Profiler::instance().calls(ProfilerKey::Cache { name })
}

#[cfg(not(feature = "profiler"))]
pub fn cache_event_count(_name: &'static str) -> u64 {
    0
}

#[derive(Debug, Clone, Serialize)]
pub struct TableRow {
    pub name: String,
    pub calls: u64,
    pub excl_ms: f64,
    pub incl_ms: f64,
    pub elements: u64,
    pub bytes_written: u64,
    pub flops: u64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ProfilerReport {
    pub backend: Vec<TableRow>,
    pub compilation: Vec<TableRow>,
    pub caches: Vec<TableRow>,
}

#[cfg(feature = "profiler")]
fn to_row(name: &'static str, stat: &Stat) -> TableRow {
    TableRow {
        name: name.to_string(),
        calls: stat.calls,
        excl_ms: stat.exclusive_ns as f64 / 1_000_000.0,
        incl_ms: stat.inclusive_ns as f64 / 1_000_000.0,
        elements: stat.work.elements,
        bytes_written: stat.work.bytes_written,
        flops: stat.work.flops,
    }
}

/// Drains the collected statistics. Returns `None` when nothing was recorded.
#[cfg(feature = "profiler")]
pub fn take_report() -> Option<ProfilerReport> {
    let stats = Profiler::instance().take_stats();
    if stats.is_empty() {
        return None;
    }
    let mut report = ProfilerReport::default();
    for (key, stat) in &stats {
        match *key {
            ProfilerKey::Backend { name } => report.backend.push(to_row(name, stat)),
            ProfilerKey::Compile { name } => report.compilation.push(to_row(name, stat)),
            ProfilerKey::Cache { name } => report.caches.push(to_row(name, stat)),
        }
    }
    for table in [
        &mut report.backend,
        &mut report.compilation,
        &mut report.caches,
    ] {
        table.sort_by(|a, b| {
            b.excl_ms
                .total_cmp(&a.excl_ms)
                .then_with(|| b.calls.cmp(&a.calls))
                .then_with(|| a.name.cmp(&b.name))
        });
    }
    Some(report)
}

#[cfg(not(feature = "profiler"))]
pub fn take_report() -> Option<ProfilerReport> {
    None
}

pub fn take_report_json() -> Option<String> {
    let report = take_report()?;
    serde_json::to_string_pretty(&report).ok()
}

#[cfg(feature = "profiler")]
pub fn reset() {
    Profiler::instance().reset();
}

#[cfg(not(feature = "profiler"))]
pub fn reset() {}
