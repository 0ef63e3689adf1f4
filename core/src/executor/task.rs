use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::types::{TaskId, TaskProgress};

/// The work a task performs.
///
/// A payload is consumed exactly once by the worker that runs it. It should
/// watch `ctx` for cancellation at its own checkpoints; the engine settles
/// the task the moment cancellation or a timeout fires regardless, so a
/// payload that keeps going is only burning cycles, not blocking anyone.
#[async_trait]
pub trait TaskPayload: Send + 'static {
    async fn run(self: Box<Self>, ctx: TaskContext) -> anyhow::Result<Value>;
}

/// Adapter so a plain async closure can be submitted as a payload.
pub struct TaskFn<F>(F);

impl<F, Fut> TaskFn<F>
where
    F: FnOnce(TaskContext) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> TaskPayload for TaskFn<F>
where
    F: FnOnce(TaskContext) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn run(self: Box<Self>, ctx: TaskContext) -> anyhow::Result<Value> {
        (self.0)(ctx).await
    }
}

/// Handed to a payload when it starts running.
#[derive(Clone)]
pub struct TaskContext {
    id: TaskId,
    cancel: CancellationToken,
    progress: ProgressReporter,
}

impl TaskContext {
    pub(crate) fn new(id: TaskId, cancel: CancellationToken, progress: ProgressReporter) -> Self {
        Self {
            id,
            cancel,
            progress,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// True once the task has been cancelled or timed out. Cheap to poll
    /// inside loops.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the task is cancelled. Meant for `tokio::select!`
    /// against long awaits inside the payload.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }
}

/// Lets a payload publish progress without knowing about the engine.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<dyn Fn(TaskProgress) + Send + Sync>,
}

impl ProgressReporter {
    pub(crate) fn new(sink: Arc<dyn Fn(TaskProgress) + Send + Sync>) -> Self {
        Self { sink }
    }

    pub fn report(&self, fraction: f64, stage: impl Into<String>) {
        (self.sink)(TaskProgress::at(fraction, stage));
    }

    pub fn report_with(&self, fraction: f64, stage: impl Into<String>, metadata: Value) {
        let mut progress = TaskProgress::at(fraction, stage);
        progress.metadata = Some(metadata);
        (self.sink)(progress);
    }
}
