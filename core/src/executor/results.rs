//! Terminal transitions for task records. Pure data mutation, no I/O, so
//! the policy can change without touching the scheduling loop.
//!
//! Each settle function is a no-op returning `false` when the record is
//! already terminal. A record reaches a terminal status exactly once.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::types::{TaskFault, TaskRecord, TaskStatus};

pub(crate) fn settle_completed(record: &mut TaskRecord, result: Value, now: DateTime<Utc>) -> bool {
    if record.status.is_terminal() {
        return false;
    }
    record.status = TaskStatus::Completed;
    record.result = Some(result);
    record.ended_at = Some(now);
    record.progress.fraction = 1.0;
    record.progress.stage = "completed".to_string();
    true
}

pub(crate) fn settle_failed(record: &mut TaskRecord, fault: TaskFault, now: DateTime<Utc>) -> bool {
    if record.status.is_terminal() {
        return false;
    }
    record.status = TaskStatus::Failed;
    record.error = Some(fault);
    record.ended_at = Some(now);
    record.progress.stage = "failed".to_string();
    true
}

/// Settle as cancelled. `fault` is only provided for forced cancellation,
/// e.g. a worker still running when the shutdown drain deadline expires;
/// an ordinary cancel leaves any existing error untouched.
pub(crate) fn settle_cancelled(
    record: &mut TaskRecord,
    fault: Option<TaskFault>,
    now: DateTime<Utc>,
) -> bool {
    if record.status.is_terminal() {
        return false;
    }
    record.status = TaskStatus::Cancelled;
    if let Some(fault) = fault {
        record.error = Some(fault);
    }
    record.ended_at = Some(now);
    record.progress.stage = "cancelled".to_string();
    true
}
