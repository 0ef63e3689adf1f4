use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::config::MonitorConfig;

use super::types::ResourceLimits;

/// Point-in-time view of the resources the engine gates on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f32,
    pub free_memory_mb: u64,
    pub running_tasks: usize,
}

/// Why an admission check said no.
///
/// `PermanentLimit` means the task could never run on this machine, so the
/// submitter gets a synchronous error. `TemporaryBackpressure` means the
/// system is busy right now and the task should wait in its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalKind {
    PermanentLimit,
    TemporaryBackpressure,
}

#[derive(Debug, Clone, Serialize)]
pub struct Refusal {
    pub kind: RefusalKind,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    pub snapshot: ResourceSnapshot,
}

impl Refusal {
    pub fn is_permanent(&self) -> bool {
        self.kind == RefusalKind::PermanentLimit
    }
}

/// Outcome of asking whether a task may start right now.
#[derive(Debug, Clone)]
pub enum Admission {
    Run,
    Refuse(Refusal),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Run)
    }

    pub fn refusal(&self) -> Option<&Refusal> {
        match self {
            Self::Run => None,
            Self::Refuse(refusal) => Some(refusal),
        }
    }
}

/// Gate that decides whether a task may start, given its limits and the
/// current state of the machine.
pub trait ResourceMonitor: Send + Sync {
    /// Check whether a task with these limits may start now.
    fn admit(&self, limits: &ResourceLimits) -> Admission;

    /// Current resource view, refreshed at most once per configured interval.
    fn snapshot(&self) -> ResourceSnapshot;

    /// Called when a worker starts executing a task.
    fn task_started(&self) {}

    /// Called when a worker settles, successfully or not.
    fn task_finished(&self) {}
}

/// Pure admission decision, separated from the sysinfo plumbing so it can
/// be exercised against synthetic snapshots.
fn decide(
    config: &MonitorConfig,
    total_memory_mb: u64,
    snapshot: ResourceSnapshot,
    limits: &ResourceLimits,
) -> Admission {
    if let Some(mb) = limits.max_memory_mb {
        if mb > total_memory_mb {
            return Admission::Refuse(Refusal {
                kind: RefusalKind::PermanentLimit,
                reason: format!(
                    "task requires {mb}MB free memory but the system has {total_memory_mb}MB total"
                ),
                suggestion: Some("lower max_memory_mb for this task".to_string()),
                snapshot,
            });
        }
    }

    if config.max_concurrent == 0 {
        return Admission::Refuse(Refusal {
            kind: RefusalKind::PermanentLimit,
            reason: "background task execution is disabled (max_concurrent = 0)".to_string(),
            suggestion: Some("raise monitor.max_concurrent in the config".to_string()),
            snapshot,
        });
    }

    if snapshot.running_tasks >= config.max_concurrent {
        return Admission::Refuse(Refusal {
            kind: RefusalKind::TemporaryBackpressure,
            reason: format!(
                "{} of {} task slots in use",
                snapshot.running_tasks, config.max_concurrent
            ),
            suggestion: Some("wait for running tasks to finish".to_string()),
            snapshot,
        });
    }

    let cpu_threshold = limits.max_cpu_percent.unwrap_or(config.max_cpu_percent);
    if snapshot.cpu_percent > cpu_threshold {
        return Admission::Refuse(Refusal {
            kind: RefusalKind::TemporaryBackpressure,
            reason: format!(
                "system CPU usage {:.1}% is above the {:.1}% threshold",
                snapshot.cpu_percent, cpu_threshold
            ),
            suggestion: None,
            snapshot,
        });
    }

    let required_free_mb = limits.max_memory_mb.unwrap_or(config.min_free_memory_mb);
    if snapshot.free_memory_mb < required_free_mb {
        return Admission::Refuse(Refusal {
            kind: RefusalKind::TemporaryBackpressure,
            reason: format!(
                "{}MB free memory is below the required {}MB",
                snapshot.free_memory_mb, required_free_mb
            ),
            suggestion: None,
            snapshot,
        });
    }

    Admission::Run
}

struct SystemSample {
    sys: sysinfo::System,
    taken_at: Instant,
    cpu_percent: f32,
    free_memory_mb: u64,
}

impl SystemSample {
    fn new() -> Self {
        let mut sys = sysinfo::System::new();
        sys.refresh_cpu();
        sys.refresh_memory();
        let cpu_count = sys.cpus().len().max(1);
        let cpu_percent = sys.cpus().iter().map(|c| c.cpu_usage()).sum::<f32>() / cpu_count as f32;
        let free_memory_mb = sys.available_memory() / (1024 * 1024);

        Self {
            sys,
            taken_at: Instant::now(),
            cpu_percent,
            free_memory_mb,
        }
    }

    /// Refresh at most once per `interval`. Reuses the single System
    /// instance instead of re-detecting hardware on every call.
    fn refresh_if_stale(&mut self, interval: Duration) {
        if self.taken_at.elapsed() < interval {
            return;
        }
        self.sys.refresh_cpu();
        self.sys.refresh_memory();
        let cpu_count = self.sys.cpus().len().max(1);
        self.cpu_percent =
            self.sys.cpus().iter().map(|c| c.cpu_usage()).sum::<f32>() / cpu_count as f32;
        self.free_memory_mb = self.sys.available_memory() / (1024 * 1024);
        self.taken_at = Instant::now();
    }
}

/// Monitor backed by live system measurements via sysinfo.
pub struct SystemResourceMonitor {
    config: MonitorConfig,
    total_memory_mb: u64,
    running: AtomicUsize,
    sample: Mutex<SystemSample>,
}

impl SystemResourceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let sample = SystemSample::new();
        let total_memory_mb = sample.sys.total_memory() / (1024 * 1024);

        Self {
            config,
            total_memory_mb,
            running: AtomicUsize::new(0),
            sample: Mutex::new(sample),
        }
    }

    pub fn total_memory_mb(&self) -> u64 {
        self.total_memory_mb
    }
}

impl ResourceMonitor for SystemResourceMonitor {
    fn admit(&self, limits: &ResourceLimits) -> Admission {
        let admission = decide(&self.config, self.total_memory_mb, self.snapshot(), limits);
        if let Admission::Refuse(ref refusal) = admission {
            debug!(
                kind = ?refusal.kind,
                reason = %refusal.reason,
                "admission refused"
            );
        }
        admission
    }

    fn snapshot(&self) -> ResourceSnapshot {
        let mut sample = match self.sample.lock() {
            Ok(sample) => sample,
            Err(poisoned) => poisoned.into_inner(),
        };
        sample.refresh_if_stale(Duration::from_millis(self.config.refresh_interval_ms));

        ResourceSnapshot {
            cpu_percent: sample.cpu_percent,
            free_memory_mb: sample.free_memory_mb,
            running_tasks: self.running.load(Ordering::SeqCst),
        }
    }

    fn task_started(&self) {
        self.running.fetch_add(1, Ordering::SeqCst);
    }

    fn task_finished(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Monitor that admits everything. Useful for tests and for embedding the
/// engine where the host manages resources itself.
#[derive(Default)]
pub struct UnlimitedMonitor {
    running: AtomicUsize,
}

impl UnlimitedMonitor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResourceMonitor for UnlimitedMonitor {
    fn admit(&self, _limits: &ResourceLimits) -> Admission {
        Admission::Run
    }

    fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            cpu_percent: 0.0,
            free_memory_mb: u64::MAX / (1024 * 1024),
            running_tasks: self.running.load(Ordering::SeqCst),
        }
    }

    fn task_started(&self) {
        self.running.fetch_add(1, Ordering::SeqCst);
    }

    fn task_finished(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}
