//! Local CPU sampling for heartbeats

use std::sync::Mutex;
use sysinfo::System;

/// Source of the CPU figure carried in each heartbeat
pub trait CpuSampler: Send + Sync {
    /// Whole-machine usage in percent, `None` when unknown
    fn sample(&self) -> Option<f64>;
}

/// Samples the machine via `sysinfo`
///
/// Usage is computed between consecutive refreshes, so the first sample after
/// construction covers the time since `new`.
pub struct SysinfoCpuSampler {
    system: Mutex<System>,
}

impl SysinfoCpuSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoCpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuSampler for SysinfoCpuSampler {
    fn sample(&self) -> Option<f64> {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_cpu();
        let usage = f64::from(system.global_cpu_info().cpu_usage());
        usage.is_finite().then(|| usage.round())
    }
}

/// Always reports the same value
#[derive(Debug, Clone, Copy)]
pub struct FixedCpuSampler(pub f64);

impl CpuSampler for FixedCpuSampler {
    fn sample(&self) -> Option<f64> {
        Some(self.0)
    }
}
