// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-core CPU utilization sampling, assumed as an external interface by
//! spec.md §1 ("system CPU statistics sampling"). Feeds the `CPU[<i>]` /
//! `totalCPU` scalar rows of spec.md §6.2.

use sysinfo::{CpuExt, CpuRefreshKind, RefreshKind, System, SystemExt};

/// One sampled snapshot: per-core utilization percentages plus the overall
/// average, in the order the system reports cores.
#[derive(Clone, Debug, Default)]
pub struct CpuSample {
    pub per_core: Vec<f32>,
    pub total: f32,
}

/// Abstracts over the system CPU sampler so `measurement` can be tested
/// without touching `/proc`.
pub trait CpuSampler: Send {
    fn sample(&mut self) -> CpuSample;
}

/// `sysinfo`-backed sampler, grounded on the teacher's own
/// `netbench::collector::procinfo::Proc` (same crate, same refresh/read
/// shape, generalized here from per-process to per-core system-wide usage).
pub struct SysinfoCpuSampler {
    system: System,
}

impl SysinfoCpuSampler {
    pub fn new() -> Self {
        let mut system = System::new_with_specifics(
            RefreshKind::new().with_cpu(CpuRefreshKind::new().with_cpu_usage()),
        );
        system.refresh_cpu();
        Self { system }
    }
}

impl Default for SysinfoCpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuSampler for SysinfoCpuSampler {
    fn sample(&mut self) -> CpuSample {
        self.system.refresh_cpu();
        let per_core: Vec<f32> = self.system.cpus().iter().map(|c| c.cpu_usage()).collect();
        let total = if per_core.is_empty() {
            0.0
        } else {
            per_core.iter().sum::<f32>() / per_core.len() as f32
        };
        CpuSample { per_core, total }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSampler(f32);

    impl CpuSampler for FakeSampler {
        fn sample(&mut self) -> CpuSample {
            CpuSample {
                per_core: vec![self.0, self.0],
                total: self.0,
            }
        }
    }

    #[test]
    fn fake_sampler_reports_configured_value() {
        let mut sampler = FakeSampler(12.5);
        let sample = sampler.sample();
        assert_eq!(sample.per_core, vec![12.5, 12.5]);
        assert_eq!(sample.total, 12.5);
    }
}
