//! Dashboard process statistics for `/dashboard_stats`.

use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

#[derive(Clone, Copy, Debug, Serialize)]
pub struct DashboardStats {
    pub cpu_percent: f64,
    pub uptime_seconds: f64,
}

/// Samples the dashboard's own CPU usage; `cpu_usage` is a delta against
/// the previous refresh, so the sampler keeps one `System` alive.
pub struct CpuSampler {
    system: Mutex<System>,
    pid: Pid,
    started_at: Instant,
}

impl CpuSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: Pid::from_u32(std::process::id()),
            started_at: Instant::now(),
        }
    }

    pub fn sample(&self) -> DashboardStats {
        let mut system = self.system.lock().expect("cpu sampler poisoned");
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::nothing().with_cpu(),
        );
        let cpu = system
            .process(self.pid)
            .map(|process| process.cpu_usage() as f64)
            .unwrap_or(0.0);

        DashboardStats {
            cpu_percent: (cpu * 10.0).round() / 10.0,
            uptime_seconds: (self.started_at.elapsed().as_secs_f64() * 10.0).round() / 10.0,
        }
    }
}

impl Default for CpuSampler {
    fn default() -> Self {
        Self::new()
    }
}
