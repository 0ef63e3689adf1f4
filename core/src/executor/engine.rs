use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, CleanupConfig, EngineConfig};
use crate::error::{EngineError, ErrorCode};
use crate::util::sanitize_log_text;

use super::cleanup::{self, CleanupEntry};
use super::monitor::{Admission, ResourceMonitor, ResourceSnapshot, SystemResourceMonitor};
use super::progress::{ExecutionObserver, ProgressMonitor};
use super::results;
use super::scheduler::{Dispatch, QueuedTask, TaskScheduler};
use super::task::{ProgressReporter, TaskContext, TaskFn, TaskPayload};
use super::types::{ExecutionConfig, TaskFault, TaskId, TaskProgress, TaskRecord, TaskStatus};

/// Everything the engine owns for one running task. Removing the handle
/// from the worker map doubles as the token for releasing the task's
/// resource registration, so the slot is released exactly once even when
/// shutdown and the worker finish concurrently.
struct WorkerHandle {
    join: JoinHandle<()>,
    cancel: CancellationToken,
}

struct EngineState {
    records: HashMap<TaskId, TaskRecord>,
    scheduler: TaskScheduler,
    workers: HashMap<TaskId, WorkerHandle>,
    cleanups: HashMap<TaskId, CleanupEntry>,
}

struct EngineInner {
    engine_cfg: EngineConfig,
    cleanup_cfg: CleanupConfig,
    monitor: Arc<dyn ResourceMonitor>,
    progress: ProgressMonitor,
    state: Mutex<EngineState>,
    /// Re-entrancy guard: at most one scheduling pass runs at a time.
    scheduling: AtomicBool,
    /// Set when a trigger arrives while a pass is running, so the pass
    /// re-runs instead of the trigger being lost.
    rerun: AtomicBool,
    draining: AtomicBool,
    cleanup_epoch: AtomicU64,
    drain_tx: watch::Sender<bool>,
    settle_tx: watch::Sender<u64>,
}

/// How a worker's race between body, timeout and cancellation came out.
enum Settle {
    Completed(Value),
    Failed(TaskFault),
    Cancelled,
}

/// Resource-aware background task executor.
///
/// Tasks are queued by priority, started only when the resource monitor
/// admits them, and settle exactly once as completed, failed or
/// cancelled. Finished records stay readable for a retention window and
/// are then removed by deferred cleanup timers.
///
/// The engine is cheap to clone and all clones share state. Submission
/// and the other non-async methods must be called from within a tokio
/// runtime because workers and cleanup timers are spawned onto it.
#[derive(Clone)]
pub struct TaskEngine {
    inner: Arc<EngineInner>,
}

/// Snapshot of engine state for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub total_records: usize,
    pub queued: QueueDepths,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub pending_cleanups: usize,
    pub resources: ResourceSnapshot,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueDepths {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl QueueDepths {
    pub fn total(&self) -> usize {
        self.high + self.medium + self.low
    }
}

pub struct EngineBuilder {
    config: AppConfig,
    monitor: Option<Arc<dyn ResourceMonitor>>,
    observer: Option<Arc<dyn ExecutionObserver>>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            monitor: None,
            observer: None,
        }
    }

    /// Replace the default system-backed monitor.
    pub fn monitor(mut self, monitor: Arc<dyn ResourceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Attach an engine-wide observer for progress and lifecycle events.
    pub fn observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> TaskEngine {
        let monitor = self
            .monitor
            .unwrap_or_else(|| Arc::new(SystemResourceMonitor::new(self.config.monitor.clone())));

        let (drain_tx, _) = watch::channel(false);
        let (settle_tx, _) = watch::channel(0u64);

        TaskEngine {
            inner: Arc::new(EngineInner {
                engine_cfg: self.config.engine,
                cleanup_cfg: self.config.cleanup,
                monitor,
                progress: ProgressMonitor::new(self.observer),
                state: Mutex::new(EngineState {
                    records: HashMap::new(),
                    scheduler: TaskScheduler::new(),
                    workers: HashMap::new(),
                    cleanups: HashMap::new(),
                }),
                scheduling: AtomicBool::new(false),
                rerun: AtomicBool::new(false),
                draining: AtomicBool::new(false),
                cleanup_epoch: AtomicU64::new(0),
                drain_tx,
                settle_tx,
            }),
        }
    }
}

impl TaskEngine {
    pub fn new(config: AppConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: AppConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Submit a payload for execution. Returns the new task id.
    ///
    /// Fails synchronously with `ValidationError` when the limits are
    /// malformed or can never be satisfied on this machine, and with
    /// `StateError` once shutdown has begun. A task the system merely
    /// cannot run right now is accepted and queued.
    pub fn submit<P: TaskPayload>(
        &self,
        payload: P,
        config: ExecutionConfig,
    ) -> Result<TaskId, EngineError> {
        self.submit_boxed(Box::new(payload), config)
    }

    /// Submit a plain async closure.
    pub fn submit_fn<F, Fut>(&self, config: ExecutionConfig, f: F) -> Result<TaskId, EngineError>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send,
    {
        self.submit_boxed(Box::new(TaskFn::new(f)), config)
    }

    fn submit_boxed(
        &self,
        payload: Box<dyn TaskPayload>,
        config: ExecutionConfig,
    ) -> Result<TaskId, EngineError> {
        if self.inner.draining.load(Ordering::SeqCst) {
            return Err(EngineError::Draining);
        }

        config.validate(self.inner.engine_cfg.max_task_duration_ms)?;

        if let Admission::Refuse(refusal) = self.inner.monitor.admit(&config.limits) {
            if refusal.is_permanent() {
                return Err(EngineError::Rejected { refusal });
            }
            // Temporary pressure: accept and let the queue wait it out.
        }

        let id = TaskId::generate();
        let record = TaskRecord::queued(id.clone(), config);
        let limits = record.config.limits;
        let snapshot = record.clone();

        {
            let mut state = self.state();
            // Re-checked under the lock so a submission racing shutdown
            // cannot slip in after the drain sweep.
            if self.inner.draining.load(Ordering::SeqCst) {
                return Err(EngineError::Draining);
            }
            state.records.insert(id.clone(), record);
            state.scheduler.enqueue(
                snapshot.config.priority,
                QueuedTask {
                    id: id.clone(),
                    limits,
                    payload,
                },
            );
        }

        debug!(task_id = %id, priority = %snapshot.config.priority, "task submitted");
        self.inner.progress.register(&snapshot);
        self.trigger();
        Ok(id)
    }

    /// Kick the scheduling loop. Overlapping triggers collapse into the
    /// already-running pass.
    fn trigger(&self) {
        if self
            .inner
            .scheduling
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.inner.rerun.store(true, Ordering::SeqCst);
            return;
        }

        loop {
            self.scheduling_pass();
            self.inner.scheduling.store(false, Ordering::SeqCst);

            if !self.inner.rerun.swap(false, Ordering::SeqCst) {
                break;
            }
            if self
                .inner
                .scheduling
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                // Someone else took over and will run a full pass.
                break;
            }
        }
    }

    /// Start queued tasks until the queues are empty or the head of the
    /// highest non-empty queue is refused admission.
    fn scheduling_pass(&self) {
        loop {
            let dispatched = {
                let mut state = self.state();
                if self.inner.draining.load(Ordering::SeqCst) {
                    None
                } else {
                    match state.scheduler.next_runnable(self.inner.monitor.as_ref()) {
                        Dispatch::Task(entry) => self.start_worker_locked(&mut state, entry),
                        Dispatch::Blocked { id, refusal } => {
                            debug!(
                                task_id = %id,
                                kind = ?refusal.kind,
                                reason = %refusal.reason,
                                "queue head blocked on resources"
                            );
                            None
                        }
                        Dispatch::Idle => None,
                    }
                }
            };

            let Some((id, callbacks)) = dispatched else {
                break;
            };
            self.inner
                .progress
                .notify_lifecycle(&id, TaskStatus::Running, callbacks.as_ref());
        }
    }

    /// Transition a dequeued task to Running and spawn its worker. Runs
    /// under the state lock so cancellation cannot interleave between
    /// dequeue and start.
    #[allow(clippy::type_complexity)]
    fn start_worker_locked(
        &self,
        state: &mut EngineState,
        entry: QueuedTask,
    ) -> Option<(TaskId, Option<Arc<dyn ExecutionObserver>>)> {
        let QueuedTask { id, limits, payload } = entry;

        let record = state.records.get_mut(&id)?;
        if record.status != TaskStatus::Queued {
            return None;
        }
        record.status = TaskStatus::Running;
        record.started_at = Some(Utc::now());
        record.progress = TaskProgress::for_status(TaskStatus::Running);
        let callbacks = record.config.callbacks.clone();

        let cancel = CancellationToken::new();
        self.inner.monitor.task_started();
        debug!(task_id = %id, "task started");

        let engine = self.clone();
        let worker_id = id.clone();
        let worker_cancel = cancel.clone();
        let join = tokio::spawn(async move {
            engine
                .run_worker(worker_id, payload, limits.max_duration_ms, worker_cancel)
                .await;
        });

        state
            .workers
            .insert(id.clone(), WorkerHandle { join, cancel });
        Some((id, callbacks))
    }

    /// Race the payload against its timeout and cancellation, then settle.
    ///
    /// `select!` drops the losing branches, so a finished body clears its
    /// pending timeout and a fired timeout stops the body at its next
    /// await point. No timer outlives the task it guards.
    async fn run_worker(
        self,
        id: TaskId,
        payload: Box<dyn TaskPayload>,
        max_duration_ms: Option<u64>,
        cancel: CancellationToken,
    ) {
        let sink_engine = self.clone();
        let sink_id = id.clone();
        let reporter = ProgressReporter::new(Arc::new(move |progress| {
            sink_engine.apply_progress(&sink_id, progress);
        }));
        let ctx = TaskContext::new(id.clone(), cancel.clone(), reporter);

        let body = std::panic::AssertUnwindSafe(payload.run(ctx)).catch_unwind();
        tokio::pin!(body);

        let settle = tokio::select! {
            biased;
            _ = cancel.cancelled() => Settle::Cancelled,
            _ = async {
                match max_duration_ms {
                    Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
                    None => std::future::pending().await,
                }
            } => {
                // Set the flag first so the body observes cancellation,
                // but a timeout always settles as Failed.
                cancel.cancel();
                Settle::Failed(TaskFault::timeout(max_duration_ms.unwrap_or_default()))
            }
            outcome = &mut body => match outcome {
                Ok(Ok(value)) => Settle::Completed(value),
                Ok(Err(err)) => {
                    if cancel.is_cancelled() {
                        Settle::Cancelled
                    } else {
                        Settle::Failed(TaskFault::new(ErrorCode::TaskFailed, err.to_string()))
                    }
                }
                Err(panic) => Settle::Failed(TaskFault::new(
                    ErrorCode::TaskFailed,
                    format!("task panicked: {}", panic_message(panic)),
                )),
            },
        };

        self.finalize(&id, settle);
    }

    /// Worker epilogue: settle the record (terminal-once), release the
    /// worker slot and keep the loop moving. Contains no await points, so
    /// once a worker reaches it, it always runs to completion.
    fn finalize(&self, id: &TaskId, settle: Settle) {
        let now = Utc::now();
        let mut lifecycle = None;
        let failure = match &settle {
            Settle::Failed(fault) => Some(sanitize_log_text(&fault.message)),
            _ => None,
        };

        let owned_handle = {
            let mut state = self.state();
            let owned = state.workers.remove(id);
            if let Some(record) = state.records.get_mut(id) {
                let changed = match settle {
                    Settle::Completed(value) => results::settle_completed(record, value, now),
                    Settle::Failed(fault) => results::settle_failed(record, fault, now),
                    Settle::Cancelled => results::settle_cancelled(record, None, now),
                };
                if changed {
                    lifecycle = Some((record.status, record.config.callbacks.clone()));
                }
            }
            owned
        };

        if owned_handle.is_some() {
            self.inner.monitor.task_finished();
        }
        self.inner.settle_tx.send_modify(|n| *n += 1);

        if let Some((status, callbacks)) = lifecycle {
            match &failure {
                Some(error) => warn!(task_id = %id, status = %status, error = %error, "task settled"),
                None => info!(task_id = %id, status = %status, "task settled"),
            }
            self.inner
                .progress
                .notify_lifecycle(id, status, callbacks.as_ref());
            self.schedule_cleanup(id);
        }

        if !self.inner.draining.load(Ordering::SeqCst) {
            self.trigger();
        }
    }

    /// Sink for progress reports coming from payloads.
    fn apply_progress(&self, id: &TaskId, progress: TaskProgress) {
        let applied = {
            let mut state = self.state();
            match state.records.get_mut(id) {
                Some(record) => {
                    let callbacks = record.config.callbacks.clone();
                    self.inner
                        .progress
                        .apply(record, progress)
                        .map(|stored| (stored, callbacks))
                }
                None => None,
            }
        };

        if let Some((stored, callbacks)) = applied {
            self.inner
                .progress
                .notify_progress(id, stored.fraction, &stored.stage, callbacks.as_ref());
        }
    }

    /// Cancel a queued or running task.
    ///
    /// A queued task settles immediately. A running task is marked
    /// Cancelled right away and its cancellation flag set; the body stops
    /// at its next await or checkpoint, and whatever it returns afterwards
    /// is discarded.
    pub fn cancel(&self, id: &TaskId) -> Result<(), EngineError> {
        let now = Utc::now();
        let mut lifecycle = None;
        let mut was_queued = false;

        {
            let mut state = self.state();
            let Some(record) = state.records.get(id) else {
                return Err(EngineError::NotFound(id.clone()));
            };

            match record.status {
                TaskStatus::Queued => {
                    // Dropping the queue entry drops the never-run payload.
                    state.scheduler.remove(id);
                    was_queued = true;
                }
                TaskStatus::Running => {
                    if let Some(handle) = state.workers.get(id) {
                        handle.cancel.cancel();
                    }
                }
                status => {
                    return Err(EngineError::InvalidState {
                        id: id.clone(),
                        status,
                    });
                }
            }

            if let Some(record) = state.records.get_mut(id) {
                if results::settle_cancelled(record, None, now) {
                    lifecycle = Some((record.status, record.config.callbacks.clone()));
                }
            }
        }

        info!(task_id = %id, "task cancelled");
        self.inner.settle_tx.send_modify(|n| *n += 1);
        if let Some((status, callbacks)) = lifecycle {
            self.inner
                .progress
                .notify_lifecycle(id, status, callbacks.as_ref());
            self.schedule_cleanup(id);
        }
        if was_queued && !self.inner.draining.load(Ordering::SeqCst) {
            // The cancelled entry may have been a blocked queue head that
            // was shadowing admittable work behind it.
            self.trigger();
        }
        Ok(())
    }

    /// Fetch a task record. Reading a finished record postpones its
    /// deferred cleanup, a bounded number of times.
    pub fn get_task(&self, id: &TaskId) -> Result<TaskRecord, EngineError> {
        let now = Utc::now();
        let mut state = self.state();
        let snapshot = match state.records.get(id) {
            Some(record) => record.clone(),
            None => return Err(EngineError::NotFound(id.clone())),
        };
        if snapshot.status.is_terminal() {
            self.extend_retention_locked(&mut state, id, now);
        }
        Ok(snapshot)
    }

    /// Current progress for a task. Like `get_task`, counts as a read for
    /// retention purposes.
    pub fn progress(&self, id: &TaskId) -> Result<TaskProgress, EngineError> {
        let now = Utc::now();
        let mut state = self.state();
        let (progress, terminal) = match state.records.get(id) {
            Some(record) => (record.progress.clone(), record.status.is_terminal()),
            None => return Err(EngineError::NotFound(id.clone())),
        };
        if terminal {
            self.extend_retention_locked(&mut state, id, now);
        }
        Ok(progress)
    }

    /// All records, oldest submission first.
    pub fn get_all_tasks(&self) -> Vec<TaskRecord> {
        let state = self.state();
        let mut tasks: Vec<TaskRecord> = state.records.values().cloned().collect();
        tasks.sort_by_key(|record| record.created_at);
        tasks
    }

    pub fn get_tasks_by_status(&self, status: TaskStatus) -> Vec<TaskRecord> {
        let state = self.state();
        let mut tasks: Vec<TaskRecord> = state
            .records
            .values()
            .filter(|record| record.status == status)
            .cloned()
            .collect();
        tasks.sort_by_key(|record| record.created_at);
        tasks
    }

    pub fn stats(&self) -> EngineStats {
        let (total_records, depths, running, completed, failed, cancelled, pending_cleanups) = {
            let state = self.state();
            let mut running = 0;
            let mut completed = 0;
            let mut failed = 0;
            let mut cancelled = 0;
            for record in state.records.values() {
                match record.status {
                    TaskStatus::Running => running += 1,
                    TaskStatus::Completed => completed += 1,
                    TaskStatus::Failed => failed += 1,
                    TaskStatus::Cancelled => cancelled += 1,
                    TaskStatus::Queued => {}
                }
            }
            (
                state.records.len(),
                state.scheduler.depths(),
                running,
                completed,
                failed,
                cancelled,
                state.cleanups.len(),
            )
        };

        EngineStats {
            total_records,
            queued: QueueDepths {
                high: depths[0],
                medium: depths[1],
                low: depths[2],
            },
            running,
            completed,
            failed,
            cancelled,
            pending_cleanups,
            resources: self.inner.monitor.snapshot(),
        }
    }

    /// Delete every finished record now, returning how many were removed.
    pub fn clear_finished(&self) -> usize {
        let mut state = self.state();
        let finished: Vec<TaskId> = state
            .records
            .iter()
            .filter(|(_, record)| record.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &finished {
            self.delete_locked(&mut state, id);
        }
        finished.len()
    }

    /// Wait until the task settles and return its terminal record.
    pub async fn wait(&self, id: &TaskId) -> Result<TaskRecord, EngineError> {
        let mut rx = self.inner.settle_tx.subscribe();
        loop {
            {
                let state = self.state();
                match state.records.get(id) {
                    Some(record) if record.status.is_terminal() => return Ok(record.clone()),
                    Some(_) => {}
                    None => return Err(EngineError::NotFound(id.clone())),
                }
            }
            if rx.changed().await.is_err() {
                return Err(EngineError::NotFound(id.clone()));
            }
        }
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::SeqCst)
    }

    /// Stop accepting work and wind everything down.
    ///
    /// Queued tasks settle as Cancelled immediately. Running tasks get
    /// their cancellation flags set and a bounded drain window to settle;
    /// whatever is still running at the deadline is force-cancelled with a
    /// synthetic fault. Idempotent: every caller, first or repeat, waits
    /// on the same drain and returns once it completes.
    pub async fn shutdown(&self) {
        if !self.inner.draining.swap(true, Ordering::SeqCst) {
            let engine = self.clone();
            tokio::spawn(async move {
                engine.drain().await;
                let _ = engine.inner.drain_tx.send(true);
            });
        }

        let mut rx = self.inner.drain_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    async fn drain(&self) {
        info!("task engine draining");
        let now = Utc::now();
        let mut cancelled = Vec::new();

        {
            let mut state = self.state();
            for entry in state.scheduler.drain() {
                if let Some(record) = state.records.get_mut(&entry.id) {
                    if results::settle_cancelled(record, None, now) {
                        cancelled.push((entry.id.clone(), record.config.callbacks.clone()));
                    }
                }
            }
            for handle in state.workers.values() {
                handle.cancel.cancel();
            }
        }

        self.inner.settle_tx.send_modify(|n| *n += 1);
        for (id, callbacks) in cancelled {
            self.inner
                .progress
                .notify_lifecycle(&id, TaskStatus::Cancelled, callbacks.as_ref());
        }

        let deadline =
            tokio::time::sleep(Duration::from_millis(self.inner.engine_cfg.drain_timeout_ms));
        tokio::pin!(deadline);
        let mut rx = self.inner.settle_tx.subscribe();
        loop {
            if self.state().workers.is_empty() {
                break;
            }
            tokio::select! {
                _ = &mut deadline => {
                    self.force_cancel_running();
                    break;
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        let entries: Vec<CleanupEntry> = {
            let mut state = self.state();
            state.cleanups.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.abort();
        }

        info!("task engine drained");
    }

    /// Drain deadline expired: settle every worker still registered and
    /// release its slot without waiting any longer.
    fn force_cancel_running(&self) {
        let now = Utc::now();
        let mut lifecycle = Vec::new();
        let mut handles = Vec::new();

        {
            let mut state = self.state();
            let workers: Vec<(TaskId, WorkerHandle)> = state.workers.drain().collect();
            for (id, handle) in workers {
                if let Some(record) = state.records.get_mut(&id) {
                    if results::settle_cancelled(record, Some(TaskFault::drain_deadline()), now) {
                        warn!(task_id = %id, "still running at drain deadline, forcing cancellation");
                        lifecycle.push((id.clone(), record.config.callbacks.clone()));
                    }
                }
                handles.push(handle);
            }
        }

        for handle in &handles {
            handle.join.abort();
            self.inner.monitor.task_finished();
        }
        self.inner.settle_tx.send_modify(|n| *n += 1);
        for (id, callbacks) in lifecycle {
            self.inner
                .progress
                .notify_lifecycle(&id, TaskStatus::Cancelled, callbacks.as_ref());
        }
    }

    /// Retention decision after a terminal transition: delete overdue
    /// records at once, evict the oldest finished ones while over the
    /// history cap, and otherwise arm a one-shot deferred delete unless
    /// one is already pending.
    fn schedule_cleanup(&self, id: &TaskId) {
        if self.inner.draining.load(Ordering::SeqCst) {
            return;
        }
        let now = Utc::now();
        let cfg = &self.inner.cleanup_cfg;
        let mut state = self.state();

        let Some(record) = state.records.get(id) else {
            return;
        };
        if !record.status.is_terminal() {
            return;
        }

        if cleanup::overdue(record, now, cfg.force_after_ms) {
            self.delete_locked(&mut state, id);
            return;
        }

        if state.records.len() > cfg.history_cap {
            let victims = cleanup::eviction_batch(&state.records, cfg.evict_batch);
            debug!(
                count = victims.len(),
                "history over cap, evicting oldest finished records"
            );
            for victim in victims {
                self.delete_locked(&mut state, &victim);
            }
        }

        if state.records.contains_key(id) && !state.cleanups.contains_key(id) {
            let epoch = self.inner.cleanup_epoch.fetch_add(1, Ordering::SeqCst);
            let timer = self.spawn_cleanup_timer(id.clone(), epoch);
            state
                .cleanups
                .insert(id.clone(), CleanupEntry::new(timer, epoch));
        }
    }

    fn delete_locked(&self, state: &mut EngineState, id: &TaskId) {
        if let Some(entry) = state.cleanups.remove(id) {
            entry.abort();
        }
        state.records.remove(id);
    }

    fn spawn_cleanup_timer(&self, id: TaskId, epoch: u64) -> JoinHandle<()> {
        let engine = self.clone();
        let retention = Duration::from_millis(self.inner.cleanup_cfg.retention_ms);
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            engine.expire(&id, epoch);
        })
    }

    /// A deferred delete fired. Only honored while its generation is
    /// current; an extension that raced the firing wins.
    fn expire(&self, id: &TaskId, epoch: u64) {
        let mut state = self.state();
        if state.cleanups.get(id).map(|entry| entry.epoch) == Some(epoch) {
            state.cleanups.remove(id);
            state.records.remove(id);
            debug!(task_id = %id, "finished task record expired");
        }
    }

    /// A finished record was read: push its deferred delete out again,
    /// within bounds. Too-old records and records read too many times are
    /// deleted instead, so reads cannot keep history alive forever.
    fn extend_retention_locked(&self, state: &mut EngineState, id: &TaskId, now: DateTime<Utc>) {
        let cfg = &self.inner.cleanup_cfg;

        let overdue = state
            .records
            .get(id)
            .map(|record| cleanup::overdue(record, now, cfg.force_after_ms))
            .unwrap_or(false);
        if overdue {
            self.delete_locked(state, id);
            return;
        }

        let Some(entry) = state.cleanups.get_mut(id) else {
            return;
        };
        entry.abort();
        entry.cancels += 1;

        if entry.cancels > cfg.max_cleanup_cancels {
            debug!(task_id = %id, "retention extended too often, deleting record");
            state.cleanups.remove(id);
            state.records.remove(id);
            return;
        }

        let epoch = self.inner.cleanup_epoch.fetch_add(1, Ordering::SeqCst);
        entry.epoch = epoch;
        entry.timer = self.spawn_cleanup_timer(id.clone(), epoch);
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
