//! Host resource sampling.

use serde::Serialize;
use std::sync::Mutex;
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, Networks, RefreshKind, System};

/// Point-in-time host resource usage. Unavailable fields are zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSnapshot {
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub memory_percent: f64,
    pub cpu_percent: f64,
    pub disk_used_bytes: u64,
    pub disk_total_bytes: u64,
    pub network_in_bytes: u64,
    pub network_out_bytes: u64,
}

/// Source of host resource snapshots. Sampling never fails.
pub trait SystemSampler: Send + Sync {
    fn sample(&self) -> ResourceSnapshot;
}

/// Sampler for platforms without a supported facility.
#[derive(Debug, Default)]
pub struct NullSampler;

impl SystemSampler for NullSampler {
    fn sample(&self) -> ResourceSnapshot {
        ResourceSnapshot::default()
    }
}

/// Sampler backed by `sysinfo` (Linux, macOS, Windows, FreeBSD).
///
/// CPU usage is a delta between refreshes, so the first sample after
/// construction reads zero.
pub struct SysinfoSampler {
    system: Mutex<System>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let mut system = System::new_with_specifics(
            RefreshKind::nothing()
                .with_cpu(CpuRefreshKind::nothing().with_cpu_usage())
                .with_memory(MemoryRefreshKind::nothing().with_ram()),
        );
        system.refresh_cpu_usage();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemSampler for SysinfoSampler {
    fn sample(&self) -> ResourceSnapshot {
        let mut snapshot = ResourceSnapshot::default();

        match self.system.lock() {
            Ok(mut system) => {
                system.refresh_cpu_usage();
                system.refresh_memory();

                snapshot.memory_total_bytes = system.total_memory();
                snapshot.memory_used_bytes = system.used_memory();
                snapshot.memory_percent = percent(snapshot.memory_used_bytes, snapshot.memory_total_bytes);
                snapshot.cpu_percent = sanitize(system.global_cpu_usage() as f64);
            }
            Err(_) => tracing::debug!("Resource sampler lock poisoned; memory and CPU read as zero"),
        }

        let disks = Disks::new_with_refreshed_list();
        for disk in disks.list() {
            let total = disk.total_space();
            snapshot.disk_total_bytes = snapshot.disk_total_bytes.saturating_add(total);
            snapshot.disk_used_bytes = snapshot
                .disk_used_bytes
                .saturating_add(total.saturating_sub(disk.available_space()));
        }

        let networks = Networks::new_with_refreshed_list();
        for data in networks.list().values() {
            snapshot.network_in_bytes = snapshot.network_in_bytes.saturating_add(data.total_received());
            snapshot.network_out_bytes = snapshot.network_out_bytes.saturating_add(data.total_transmitted());
        }

        snapshot
    }
}

/// Pick the sampler for the running platform.
pub fn platform_sampler() -> Box<dyn SystemSampler> {
    if sysinfo::IS_SUPPORTED_SYSTEM {
        Box::new(SysinfoSampler::new())
    } else {
        tracing::info!("Host resource sampling unsupported on this platform; reporting zeros");
        Box::new(NullSampler)
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round2(used as f64 / total as f64 * 100.0)
}

fn sanitize(f: f64) -> f64 {
    if f.is_nan() || f.is_infinite() || f < 0.0 {
        0.0
    } else {
        round2(f)
    }
}

pub(crate) fn round2(f: f64) -> f64 {
    (f * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_sampler_is_all_zero() {
        assert_eq!(NullSampler.sample(), ResourceSnapshot::default());
    }

    #[test]
    fn test_sysinfo_sampler_is_consistent() {
        let sampler = SysinfoSampler::new();
        let snap = sampler.sample();
        assert!(snap.memory_used_bytes <= snap.memory_total_bytes);
        assert!(snap.disk_used_bytes <= snap.disk_total_bytes);
        assert!((0.0..=100.0).contains(&snap.memory_percent));
        assert!(snap.cpu_percent >= 0.0);
    }

    #[test]
    fn test_percent_and_sanitize() {
        assert_eq!(percent(1, 3), 33.33);
        assert_eq!(percent(5, 0), 0.0);
        assert_eq!(sanitize(f64::NAN), 0.0);
        assert_eq!(sanitize(-1.0), 0.0);
        assert_eq!(sanitize(12.346), 12.35);
    }
}
