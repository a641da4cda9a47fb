//! Process-level vitals for hosts that cannot report game metrics.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use cloudlink_core::{MetricsSource, ServerState};

/// Reported when the process cannot be sampled.
const UNAVAILABLE: f64 = -1.0;

/// Reports what the agent process can observe about itself: uptime,
/// resident memory and CPU load. Tick rate and roster are unknown out here.
#[derive(Debug)]
pub struct ProcessMetrics {
    max_players: u32,
    started: DateTime<Utc>,
    pid: Option<Pid>,
    cores: f64,
    system: Mutex<System>,
}

impl ProcessMetrics {
    pub fn new(max_players: u32) -> Self {
        let pid = sysinfo::get_current_pid()
            .inspect_err(|e| tracing::warn!(error = %e, "cannot resolve own pid, vitals unavailable"))
            .ok();
        let cores = std::thread::available_parallelism()
            .ok()
            .and_then(|n| u32::try_from(n.get()).ok())
            .map_or(1.0, f64::from);

        let metrics = Self {
            max_players,
            started: Utc::now(),
            pid,
            cores,
            system: Mutex::new(System::new()),
        };
        // CPU load is measured between two refreshes; take the baseline now.
        drop(metrics.refresh(ProcessRefreshKind::nothing().with_cpu()));
        metrics
    }

    fn system(&self) -> MutexGuard<'_, System> {
        self.system.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refresh `kind` for this process. `None` without a pid.
    fn refresh(&self, kind: ProcessRefreshKind) -> Option<MutexGuard<'_, System>> {
        let pid = self.pid?;
        let mut system = self.system();
        system.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, kind);
        Some(system)
    }
}

impl MetricsSource for ProcessMetrics {
    fn tick_rate(&self) -> f64 {
        0.0
    }

    fn cpu_usage_pct(&self) -> f64 {
        let Some(pid) = self.pid else {
            return UNAVAILABLE;
        };
        self.refresh(ProcessRefreshKind::nothing().with_cpu())
            .and_then(|system| system.process(pid).map(|p| p.cpu_usage()))
            .map_or(UNAVAILABLE, |raw| share_of_machine(raw, self.cores))
    }

    fn ram_usage_mb(&self) -> f64 {
        let Some(pid) = self.pid else {
            return UNAVAILABLE;
        };
        self.refresh(ProcessRefreshKind::nothing().with_memory())
            .and_then(|system| system.process(pid).map(|p| p.memory()))
            .map_or(UNAVAILABLE, mebibytes)
    }

    fn players_online(&self) -> Vec<String> {
        Vec::new()
    }

    fn max_players(&self) -> u32 {
        self.max_players
    }

    fn server_state(&self) -> ServerState {
        ServerState::Online
    }

    fn is_running(&self) -> bool {
        true
    }

    fn start_time(&self) -> Option<DateTime<Utc>> {
        Some(self.started)
    }
}

#[allow(clippy::cast_precision_loss, clippy::as_conversions)]
fn mebibytes(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

/// Per-core percentage (up to `100 * cores`) scaled to the whole machine.
fn share_of_machine(raw: f32, cores: f64) -> f64 {
    (f64::from(raw) / cores).clamp(0.0, 100.0)
}
