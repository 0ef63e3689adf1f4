#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use taskmill_core::api::{
    Admission, AppConfig, ExecutionObserver, Refusal, RefusalKind, ResourceLimits,
    ResourceMonitor, ResourceSnapshot, TaskEngine, TaskId, TaskStatus, UnlimitedMonitor,
};

pub fn unlimited_engine() -> TaskEngine {
    engine_with(AppConfig::default())
}

pub fn engine_with(config: AppConfig) -> TaskEngine {
    TaskEngine::builder(config)
        .monitor(Arc::new(UnlimitedMonitor::new()))
        .build()
}

/// Admits tasks while fewer than `slots` are running, refuses temporarily
/// otherwise. Gives tests a deterministic concurrency gate without touching
/// real system resources.
pub struct SlotMonitor {
    slots: usize,
    running: AtomicUsize,
}

impl SlotMonitor {
    pub fn new(slots: usize) -> Self {
        Self {
            slots,
            running: AtomicUsize::new(0),
        }
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }
}

impl ResourceMonitor for SlotMonitor {
    fn admit(&self, _limits: &ResourceLimits) -> Admission {
        let running = self.running.load(Ordering::SeqCst);
        if running < self.slots {
            Admission::Run
        } else {
            Admission::Refuse(Refusal {
                kind: RefusalKind::TemporaryBackpressure,
                reason: format!("{} of {} task slots in use", running, self.slots),
                suggestion: None,
                snapshot: self.snapshot(),
            })
        }
    }

    fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            cpu_percent: 0.0,
            free_memory_mb: 8192,
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

/// Admits a task only when its declared memory demand fits the adjustable
/// free amount. Lets tests pin a queue head behind a resource shortage and
/// then relieve it.
pub struct DemandMonitor {
    free_mb: AtomicU64,
    running: AtomicUsize,
}

impl DemandMonitor {
    pub fn new(free_mb: u64) -> Self {
        Self {
            free_mb: AtomicU64::new(free_mb),
            running: AtomicUsize::new(0),
        }
    }

    pub fn set_free_mb(&self, free_mb: u64) {
        self.free_mb.store(free_mb, Ordering::SeqCst);
    }
}

impl ResourceMonitor for DemandMonitor {
    fn admit(&self, limits: &ResourceLimits) -> Admission {
        let demand = limits.max_memory_mb.unwrap_or(0);
        let free = self.free_mb.load(Ordering::SeqCst);
        if demand <= free {
            Admission::Run
        } else {
            Admission::Refuse(Refusal {
                kind: RefusalKind::TemporaryBackpressure,
                reason: format!("task requires {demand}MB but only {free}MB free"),
                suggestion: None,
                snapshot: self.snapshot(),
            })
        }
    }

    fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            cpu_percent: 0.0,
            free_memory_mb: self.free_mb.load(Ordering::SeqCst),
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

/// Refuses everything permanently, for exercising synchronous rejection.
pub struct RefuseAllMonitor;

impl ResourceMonitor for RefuseAllMonitor {
    fn admit(&self, _limits: &ResourceLimits) -> Admission {
        Admission::Refuse(Refusal {
            kind: RefusalKind::PermanentLimit,
            reason: "this machine never runs tasks".to_string(),
            suggestion: None,
            snapshot: self.snapshot(),
        })
    }

    fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            cpu_percent: 0.0,
            free_memory_mb: 0,
            running_tasks: 0,
        }
    }
}

/// Records every observer callback for later assertions.
#[derive(Default)]
pub struct Recording {
    pub lifecycle: Mutex<Vec<(TaskId, TaskStatus)>>,
    pub progress: Mutex<Vec<(TaskId, f64, String)>>,
}

impl Recording {
    pub fn statuses_for(&self, id: &TaskId) -> Vec<TaskStatus> {
        self.lifecycle
            .lock()
            .unwrap()
            .iter()
            .filter(|(seen, _)| seen == id)
            .map(|(_, status)| *status)
            .collect()
    }

    pub fn fractions_for(&self, id: &TaskId) -> Vec<f64> {
        self.progress
            .lock()
            .unwrap()
            .iter()
            .filter(|(seen, _, _)| seen == id)
            .map(|(_, fraction, _)| *fraction)
            .collect()
    }
}

impl ExecutionObserver for Recording {
    fn on_progress(&self, id: &TaskId, fraction: f64, stage: &str) {
        self.progress
            .lock()
            .unwrap()
            .push((id.clone(), fraction, stage.to_string()));
    }

    fn on_lifecycle(&self, id: &TaskId, status: TaskStatus) {
        self.lifecycle.lock().unwrap().push((id.clone(), status));
    }
}
