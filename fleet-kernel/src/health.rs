use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

use crate::sweep::SweepReport;

#[derive(Debug, Serialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub hosts_tracked: u32,
    pub sweeps_run: u64,
    pub sweeps_failed: u64,
    pub last_sweep: Option<SweepReport>,
    pub memory_usage_mb: f32,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    sweeps_run: Arc<AtomicU64>,
    sweeps_failed: Arc<AtomicU64>,
    last_sweep: Arc<Mutex<Option<SweepReport>>>,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<Mutex<String>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            sweeps_run: Arc::new(AtomicU64::new(0)),
            sweeps_failed: Arc::new(AtomicU64::new(0)),
            last_sweep: Arc::new(Mutex::new(None)),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(Mutex::new("disabled".to_string())),
        }
    }

    pub fn record_sweep(&self, report: &SweepReport) {
        self.sweeps_run.fetch_add(1, Ordering::Relaxed);
        if report.is_failure() {
            self.sweeps_failed.fetch_add(1, Ordering::Relaxed);
        }
        *self.last_sweep.lock() = Some(report.clone());
    }

    pub fn mark_mqtt_connecting(&self) {
        *self.mqtt_status.lock() = "connecting".to_string();
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn mark_mqtt_disconnected(&self) {
        *self.mqtt_status.lock() = "disconnected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn mqtt_status(&self) -> String {
        self.mqtt_status.lock().clone()
    }

    pub fn get_health(&self, hosts_tracked: usize) -> KernelHealth {
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            hosts_tracked: hosts_tracked as u32,
            sweeps_run: self.sweeps_run.load(Ordering::Relaxed),
            sweeps_failed: self.sweeps_failed.load(Ordering::Relaxed),
            last_sweep: self.last_sweep.lock().clone(),
            memory_usage_mb: get_memory_usage_mb(),
            mqtt_status: self.mqtt_status(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
        }
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }

    // pas de /proc : valeur nulle plutôt qu'une estimation
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweep::SweepOutcome;

    fn report(outcome: SweepOutcome) -> SweepReport {
        SweepReport {
            checked: 3,
            changed: 1,
            logged: 1,
            errored: 0,
            elapsed_ms: 40,
            outcome,
            transitions: Vec::new(),
        }
    }

    #[test]
    fn test_sweep_counters() {
        let health = HealthTracker::new();
        health.record_sweep(&report(SweepOutcome::Committed));
        health.record_sweep(&report(SweepOutcome::CommitFailed { reason: "disk full".into() }));

        let snapshot = health.get_health(3);
        assert_eq!(snapshot.sweeps_run, 2);
        assert_eq!(snapshot.sweeps_failed, 1);
        assert_eq!(snapshot.hosts_tracked, 3);
        assert!(matches!(
            snapshot.last_sweep.map(|r| r.outcome),
            Some(SweepOutcome::CommitFailed { .. })
        ));
    }

    #[test]
    fn test_mqtt_status_transitions() {
        let health = HealthTracker::new();
        assert_eq!(health.mqtt_status(), "disabled");
        health.mark_mqtt_connecting();
        health.increment_reconnects();
        assert_eq!(health.mqtt_status(), "reconnecting");
        health.mark_mqtt_connected();
        assert_eq!(health.get_health(0).mqtt_reconnects, 1);
        assert_eq!(health.mqtt_status(), "connected");
    }
}
