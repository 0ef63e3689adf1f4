use std::sync::Arc;

use tracing::trace;

use super::types::{TaskId, TaskProgress, TaskRecord, TaskStatus};

/// Receives progress and lifecycle events for tasks.
///
/// Implementations must be cheap and non-blocking. They are invoked after
/// the engine has released its own locks, so calling back into the engine
/// from an observer is allowed. All methods default to no-ops so an
/// observer can implement only what it cares about.
pub trait ExecutionObserver: Send + Sync {
    fn on_progress(&self, _id: &TaskId, _fraction: f64, _stage: &str) {}
    fn on_lifecycle(&self, _id: &TaskId, _status: TaskStatus) {}
}

/// Applies progress updates to records and relays events to observers.
///
/// Having no observer attached is the normal case, not an error. A task
/// with its own `callbacks` observer hears events in addition to the
/// engine-wide one. Mutation (`apply`) and fan-out (`notify_*`) are split
/// because records are mutated under the engine's state lock while
/// observers must run outside it.
pub(crate) struct ProgressMonitor {
    observer: Option<Arc<dyn ExecutionObserver>>,
}

impl ProgressMonitor {
    pub fn new(observer: Option<Arc<dyn ExecutionObserver>>) -> Self {
        Self { observer }
    }

    /// Make a freshly created task visible to observers.
    pub fn register(&self, record: &TaskRecord) {
        self.notify_lifecycle(&record.id, record.status, record.config.callbacks.as_ref());
    }

    /// Store a progress report on the record and return the stored
    /// snapshot.
    ///
    /// The fraction is clamped to [0, 1] and, while the task is running,
    /// never moves backwards. Reports arriving after the task settled are
    /// dropped (returning `None`) so terminal records stay final.
    pub fn apply(&self, record: &mut TaskRecord, progress: TaskProgress) -> Option<TaskProgress> {
        if record.status.is_terminal() {
            return None;
        }

        let fraction = progress
            .fraction
            .clamp(0.0, 1.0)
            .max(record.progress.fraction);
        record.progress = TaskProgress {
            fraction,
            stage: progress.stage,
            metadata: progress.metadata,
        };

        trace!(
            task_id = %record.id,
            fraction = record.progress.fraction,
            stage = %record.progress.stage,
            "task progress"
        );

        Some(record.progress.clone())
    }

    pub fn notify_progress(
        &self,
        id: &TaskId,
        fraction: f64,
        stage: &str,
        callbacks: Option<&Arc<dyn ExecutionObserver>>,
    ) {
        if let Some(observer) = &self.observer {
            observer.on_progress(id, fraction, stage);
        }
        if let Some(callbacks) = callbacks {
            callbacks.on_progress(id, fraction, stage);
        }
    }

    pub fn notify_lifecycle(
        &self,
        id: &TaskId,
        status: TaskStatus,
        callbacks: Option<&Arc<dyn ExecutionObserver>>,
    ) {
        if let Some(observer) = &self.observer {
            observer.on_lifecycle(id, status);
        }
        if let Some(callbacks) = callbacks {
            callbacks.on_lifecycle(id, status);
        }
    }
}
