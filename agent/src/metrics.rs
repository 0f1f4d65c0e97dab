//! # Host Metrics Sampler
//!
//! Collects the numbers reported alongside each heartbeat. The sysinfo
//! handle is kept across samples so CPU/memory refreshes stay cheap.

use sysinfo::{Components, Disks, System};

use burrow_protocol::HostMetrics;

pub struct MetricsSampler {
    system: System,
}

impl MetricsSampler {
    pub fn new() -> Self {
        Self {
            system: System::new_all(),
        }
    }

    /// Take a fresh sample. Fields the host cannot provide (no thermal
    /// sensor, no disks) report zero rather than failing the heartbeat.
    pub fn sample(&mut self) -> HostMetrics {
        self.system.refresh_memory();

        let cpu_temp = Components::new_with_refreshed_list()
            .iter()
            .find_map(|component| component.temperature())
            .unwrap_or(0.0) as f64;

        let disks = Disks::new_with_refreshed_list();
        let (disk_total, disk_free) = disks
            .iter()
            .fold((0u64, 0u64), |(total, free), disk| {
                (total + disk.total_space(), free + disk.available_space())
            });

        HostMetrics {
            cpu_temp,
            mem_total: self.system.total_memory(),
            mem_free: self.system.available_memory(),
            disk_total,
            disk_free,
            uptime: System::uptime(),
            load_avg: System::load_average().one,
        }
    }
}

impl Default for MetricsSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_reports_plausible_numbers() {
        let mut sampler = MetricsSampler::new();
        let metrics = sampler.sample();
        assert!(metrics.mem_total > 0);
        assert!(metrics.mem_free <= metrics.mem_total);
        assert!(metrics.disk_free <= metrics.disk_total);
    }
}
