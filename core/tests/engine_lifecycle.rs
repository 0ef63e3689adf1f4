mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::Notify;
use tokio::time::sleep;

use common::{unlimited_engine, DemandMonitor, Recording, RefuseAllMonitor, SlotMonitor};
use taskmill_core::api::{
    AppConfig, EngineError, ErrorCode, ExecutionConfig, Priority, TaskEngine, TaskId, TaskStatus,
};

fn slot_engine(slots: usize) -> (TaskEngine, Arc<SlotMonitor>) {
    let monitor = Arc::new(SlotMonitor::new(slots));
    let engine = TaskEngine::builder(AppConfig::default())
        .monitor(monitor.clone())
        .build();
    (engine, monitor)
}

#[tokio::test]
async fn submitted_task_runs_to_completion() {
    let engine = unlimited_engine();
    let id = engine
        .submit_fn(ExecutionConfig::default(), |_ctx| async {
            Ok(json!({"answer": 42}))
        })
        .expect("submit should be accepted");

    let record = engine.wait(&id).await.expect("task should settle");
    assert_eq!(record.status, TaskStatus::Completed);
    assert_eq!(record.result, Some(json!({"answer": 42})));
    assert_eq!(record.error, None);
    assert_eq!(record.progress.fraction, 1.0);
    assert_eq!(record.progress.stage, "completed");
    assert!(record.started_at.is_some());
    assert!(record.ended_at.is_some());
}

#[tokio::test]
async fn priority_orders_execution_when_capacity_frees() {
    let (engine, monitor) = slot_engine(1);
    let gate = Arc::new(Notify::new());

    let gate_task = {
        let gate = gate.clone();
        engine
            .submit_fn(ExecutionConfig::default(), move |_ctx| async move {
                gate.notified().await;
                Ok(json!(null))
            })
            .expect("gate task accepted")
    };
    assert_eq!(
        engine.get_task(&gate_task).expect("gate visible").status,
        TaskStatus::Running
    );

    let order: Arc<std::sync::Mutex<Vec<&'static str>>> = Arc::default();
    let mut queued = Vec::new();
    for (priority, label) in [
        (Priority::Low, "low"),
        (Priority::High, "high"),
        (Priority::Medium, "medium"),
    ] {
        let order = order.clone();
        let id = engine
            .submit_fn(
                ExecutionConfig::with_priority(priority),
                move |_ctx| async move {
                    order.lock().unwrap().push(label);
                    Ok(json!(null))
                },
            )
            .expect("queued task accepted");
        queued.push(id);
    }
    assert_eq!(engine.stats().queued.total(), 3);

    gate.notify_one();
    engine.wait(&gate_task).await.expect("gate settles");
    for id in &queued {
        engine.wait(id).await.expect("queued task settles");
    }

    assert_eq!(*order.lock().unwrap(), vec!["high", "medium", "low"]);
    assert_eq!(
        monitor.running(),
        0,
        "each settle releases its slot exactly once"
    );
}

#[tokio::test]
async fn blocked_head_shadows_admittable_lower_work() {
    let monitor = Arc::new(DemandMonitor::new(256));
    let engine = TaskEngine::builder(AppConfig::default())
        .monitor(monitor.clone())
        .build();

    let high = engine
        .submit_fn(
            ExecutionConfig::with_priority(Priority::High).max_memory_mb(1024),
            |_ctx| async { Ok(json!(null)) },
        )
        .expect("high task accepted despite pressure");
    let low = engine
        .submit_fn(
            ExecutionConfig::with_priority(Priority::Low),
            |_ctx| async { Ok(json!(null)) },
        )
        .expect("low task accepted");

    // The high head cannot start, and it shadows the admittable low task.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.get_task(&high).unwrap().status, TaskStatus::Queued);
    assert_eq!(engine.get_task(&low).unwrap().status, TaskStatus::Queued);

    monitor.set_free_mb(4096);
    let medium = engine
        .submit_fn(
            ExecutionConfig::with_priority(Priority::Medium),
            |_ctx| async { Ok(json!(null)) },
        )
        .expect("medium task accepted");

    let high_rec = engine.wait(&high).await.expect("high settles");
    let medium_rec = engine.wait(&medium).await.expect("medium settles");
    let low_rec = engine.wait(&low).await.expect("low settles");

    let high_start = high_rec.started_at.expect("high started");
    let medium_start = medium_rec.started_at.expect("medium started");
    let low_start = low_rec.started_at.expect("low started");
    assert!(high_start < medium_start, "high must start before medium");
    assert!(medium_start < low_start, "medium must start before low");
}

#[tokio::test]
async fn cancel_queued_task_never_runs() {
    let (engine, _monitor) = slot_engine(1);
    let gate = Arc::new(Notify::new());
    let gate_task = {
        let gate = gate.clone();
        engine
            .submit_fn(ExecutionConfig::default(), move |_ctx| async move {
                gate.notified().await;
                Ok(json!(null))
            })
            .expect("gate task accepted")
    };

    let ran = Arc::new(AtomicBool::new(false));
    let victim = {
        let ran = ran.clone();
        engine
            .submit_fn(ExecutionConfig::default(), move |_ctx| async move {
                ran.store(true, Ordering::SeqCst);
                Ok(json!(null))
            })
            .expect("victim accepted")
    };

    engine.cancel(&victim).expect("cancel queued task");
    let record = engine.get_task(&victim).expect("record kept");
    assert_eq!(record.status, TaskStatus::Cancelled);
    assert_eq!(record.error, None);
    assert_eq!(engine.stats().queued.total(), 0);

    // Cancelling an already settled task is a state error.
    let err = engine.cancel(&victim).expect_err("second cancel fails");
    assert!(matches!(err, EngineError::InvalidState { .. }));
    assert_eq!(err.error_code(), ErrorCode::StateError);

    gate.notify_one();
    engine.wait(&gate_task).await.expect("gate settles");
    sleep(Duration::from_millis(50)).await;
    assert!(!ran.load(Ordering::SeqCst), "cancelled task must never run");
}

#[tokio::test]
async fn cancel_running_task_settles_cancelled() {
    let (engine, monitor) = slot_engine(1);
    let id = engine
        .submit_fn(ExecutionConfig::default(), |ctx| async move {
            ctx.cancelled().await;
            Ok(json!("late result"))
        })
        .expect("submit accepted");
    assert_eq!(engine.get_task(&id).unwrap().status, TaskStatus::Running);

    engine.cancel(&id).expect("cancel running task");
    let record = engine.wait(&id).await.expect("task settles");
    assert_eq!(record.status, TaskStatus::Cancelled);
    assert_eq!(record.result, None, "result after cancellation is discarded");
    assert_eq!(record.error, None);

    // The settle came from cancel; the slot release comes from the worker.
    sleep(Duration::from_millis(50)).await;
    assert_eq!(monitor.running(), 0);
}

#[tokio::test]
async fn timeout_settles_failed_with_timeout_fault() {
    let engine = unlimited_engine();
    let before = Instant::now();
    let id = engine
        .submit_fn(
            ExecutionConfig::default().max_duration_ms(50),
            |_ctx| async {
                sleep(Duration::from_secs(600)).await;
                Ok(json!(null))
            },
        )
        .expect("submit accepted");

    let record = engine.wait(&id).await.expect("task settles");
    let elapsed = before.elapsed();
    assert!(elapsed >= Duration::from_millis(50), "timer fires no earlier than the limit");
    assert!(
        elapsed < Duration::from_secs(1),
        "timeout settles promptly, took {elapsed:?}"
    );
    assert_eq!(record.status, TaskStatus::Failed);
    let fault = record.error.expect("timeout fault recorded");
    assert!(fault.is_timeout());
    assert!(fault.message.contains("50ms"), "got: {}", fault.message);
    assert_eq!(record.progress.stage, "failed");
    assert!(record.ended_at.is_some());
}

#[tokio::test]
async fn body_error_settles_failed() {
    let engine = unlimited_engine();
    let id = engine
        .submit_fn(ExecutionConfig::default(), |_ctx| async {
            Err(anyhow::anyhow!("disk on fire"))
        })
        .expect("submit accepted");

    let record = engine.wait(&id).await.expect("task settles");
    assert_eq!(record.status, TaskStatus::Failed);
    let fault = record.error.expect("fault recorded");
    assert_eq!(fault.code, ErrorCode::TaskFailed);
    assert!(fault.message.contains("disk on fire"));
}

#[tokio::test]
async fn panicking_body_settles_failed_without_killing_engine() {
    let engine = unlimited_engine();
    let id = engine
        .submit_fn(ExecutionConfig::default(), |_ctx| async {
            panic!("boom");
        })
        .expect("submit accepted");

    let record = engine.wait(&id).await.expect("task settles");
    assert_eq!(record.status, TaskStatus::Failed);
    let fault = record.error.expect("fault recorded");
    assert!(fault.message.contains("task panicked"), "got: {}", fault.message);
    assert!(fault.message.contains("boom"));

    // The engine keeps serving after a payload panic.
    let next = engine
        .submit_fn(ExecutionConfig::default(), |_ctx| async { Ok(json!(1)) })
        .expect("submit accepted");
    let record = engine.wait(&next).await.expect("task settles");
    assert_eq!(record.status, TaskStatus::Completed);
}

#[tokio::test]
async fn progress_reports_clamp_and_never_regress() {
    let observer = Arc::new(Recording::default());
    let engine = TaskEngine::builder(AppConfig::default())
        .monitor(Arc::new(SlotMonitor::new(8)))
        .observer(observer.clone())
        .build();

    let id = engine
        .submit_fn(ExecutionConfig::default(), |ctx| async move {
            ctx.progress().report(0.4, "extract");
            ctx.progress().report(0.2, "extract");
            ctx.progress().report_with(2.0, "load", json!({"rows": 10}));
            Ok(json!(null))
        })
        .expect("submit accepted");

    let record = engine.wait(&id).await.expect("task settles");
    assert_eq!(record.status, TaskStatus::Completed);
    assert_eq!(observer.fractions_for(&id), vec![0.4, 0.4, 1.0]);
    assert_eq!(record.progress.fraction, 1.0);
    assert_eq!(record.progress.stage, "completed");
}

#[tokio::test]
async fn observer_sees_lifecycle_in_order() {
    let observer = Arc::new(Recording::default());
    let engine = TaskEngine::builder(AppConfig::default())
        .monitor(Arc::new(SlotMonitor::new(1)))
        .observer(observer.clone())
        .build();

    let id = engine
        .submit_fn(ExecutionConfig::default(), |_ctx| async { Ok(json!(null)) })
        .expect("submit accepted");
    engine.wait(&id).await.expect("task settles");

    assert_eq!(
        observer.statuses_for(&id),
        vec![TaskStatus::Queued, TaskStatus::Running, TaskStatus::Completed]
    );
}

#[tokio::test]
async fn per_task_callbacks_hear_events_too() {
    let engine = unlimited_engine();
    let callbacks = Arc::new(Recording::default());

    let id = engine
        .submit_fn(
            ExecutionConfig::default().callbacks(callbacks.clone()),
            |ctx| async move {
                ctx.progress().report(0.5, "halfway");
                Ok(json!(null))
            },
        )
        .expect("submit accepted");
    engine.wait(&id).await.expect("task settles");

    assert_eq!(callbacks.fractions_for(&id), vec![0.5]);
    assert_eq!(
        callbacks.statuses_for(&id),
        vec![TaskStatus::Queued, TaskStatus::Running, TaskStatus::Completed]
    );
}

#[tokio::test]
async fn invalid_duration_rejected_before_queueing() {
    let engine = unlimited_engine();

    let zero = engine.submit_fn(
        ExecutionConfig::default().max_duration_ms(0),
        |_ctx| async { Ok(json!(null)) },
    );
    let err = zero.expect_err("zero duration must be rejected");
    assert_eq!(err.error_code(), ErrorCode::ValidationError);

    let over_cap = engine.submit_fn(
        ExecutionConfig::default().max_duration_ms(3_600_001),
        |_ctx| async { Ok(json!(null)) },
    );
    assert!(over_cap.is_err(), "durations above the cap must be rejected");

    assert_eq!(engine.stats().total_records, 0);
    assert!(engine.get_all_tasks().is_empty());
}

#[tokio::test]
async fn permanent_refusal_rejects_submission() {
    let engine = TaskEngine::builder(AppConfig::default())
        .monitor(Arc::new(RefuseAllMonitor))
        .build();

    let err = engine
        .submit_fn(ExecutionConfig::default(), |_ctx| async { Ok(json!(null)) })
        .expect_err("permanent refusal is synchronous");
    assert!(matches!(err, EngineError::Rejected { .. }));
    assert_eq!(err.error_code(), ErrorCode::ValidationError);
    assert_eq!(engine.stats().total_records, 0);
}

#[tokio::test]
async fn unknown_task_operations_are_not_found() {
    let engine = unlimited_engine();
    let ghost = TaskId::from("no-such-task");

    assert!(matches!(
        engine.get_task(&ghost),
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine.progress(&ghost),
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(engine.cancel(&ghost), Err(EngineError::NotFound(_))));
    assert!(matches!(
        engine.wait(&ghost).await,
        Err(EngineError::NotFound(_))
    ));
    assert_eq!(
        engine.get_task(&ghost).unwrap_err().error_code(),
        ErrorCode::NotFoundError
    );
}

#[tokio::test]
async fn listings_are_sorted_by_creation_time() {
    let engine = unlimited_engine();
    let mut ids = Vec::new();
    for n in 0..3 {
        let id = engine
            .submit_fn(ExecutionConfig::default(), move |_ctx| async move {
                Ok(json!(n))
            })
            .expect("submit accepted");
        ids.push(id);
    }
    for id in &ids {
        engine.wait(id).await.expect("task settles");
    }

    let all = engine.get_all_tasks();
    assert_eq!(all.len(), 3);
    let listed: Vec<TaskId> = all.iter().map(|record| record.id.clone()).collect();
    assert_eq!(listed, ids, "listing follows submission order");

    assert_eq!(engine.get_tasks_by_status(TaskStatus::Completed).len(), 3);
    assert!(engine.get_tasks_by_status(TaskStatus::Failed).is_empty());
}

#[tokio::test]
async fn stats_track_queue_depth_and_terminal_counts() {
    let (engine, _monitor) = slot_engine(1);
    let gate = Arc::new(Notify::new());
    let gate_task = {
        let gate = gate.clone();
        engine
            .submit_fn(ExecutionConfig::default(), move |_ctx| async move {
                gate.notified().await;
                Ok(json!(null))
            })
            .expect("gate accepted")
    };

    let high = engine
        .submit_fn(
            ExecutionConfig::with_priority(Priority::High),
            |_ctx| async { Ok(json!(null)) },
        )
        .expect("high accepted");
    let low = engine
        .submit_fn(
            ExecutionConfig::with_priority(Priority::Low),
            |_ctx| async { Ok(json!(null)) },
        )
        .expect("low accepted");

    let stats = engine.stats();
    assert_eq!(stats.total_records, 3);
    assert_eq!(stats.running, 1);
    assert_eq!(stats.queued.high, 1);
    assert_eq!(stats.queued.medium, 0);
    assert_eq!(stats.queued.low, 1);
    assert_eq!(stats.resources.running_tasks, 1);

    gate.notify_one();
    for id in [&gate_task, &high, &low] {
        engine.wait(id).await.expect("task settles");
    }

    let stats = engine.stats();
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.running, 0);
    assert_eq!(stats.queued.total(), 0);
    assert_eq!(stats.pending_cleanups, 3);
}

#[tokio::test]
async fn wait_on_settled_task_returns_immediately() {
    let engine = unlimited_engine();
    let id = engine
        .submit_fn(ExecutionConfig::default(), |_ctx| async { Ok(json!(null)) })
        .expect("submit accepted");
    engine.wait(&id).await.expect("first wait");

    let record = engine.wait(&id).await.expect("second wait resolves at once");
    assert_eq!(record.status, TaskStatus::Completed);
}
