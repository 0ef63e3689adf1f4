use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorCode;

use super::config::ExecutionConfig;

/// Unique identifier for one submitted task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Mint a fresh v4 id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lifecycle status of a task record.
///
/// Transitions are strictly forward: `Queued -> Running -> terminal`, where
/// terminal is one of `Completed`, `Failed`, `Cancelled`. A queued task may
/// jump straight to `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Point-in-time progress of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    /// Completion fraction in `[0, 1]`.
    pub fraction: f64,

    /// Human-readable stage label ("download", "encode", ...).
    pub stage: String,

    /// Optional opaque detail supplied by the task body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl TaskProgress {
    pub fn at(fraction: f64, stage: impl Into<String>) -> Self {
        Self {
            fraction: fraction.clamp(0.0, 1.0),
            stage: stage.into(),
            metadata: None,
        }
    }

    /// Default progress derived from a lifecycle status, used until the task
    /// body reports something more specific.
    pub fn for_status(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Queued => Self::at(0.0, "queued"),
            TaskStatus::Running => Self::at(0.0, "running"),
            TaskStatus::Completed => Self::at(1.0, "completed"),
            TaskStatus::Failed => Self::at(1.0, "failed"),
            TaskStatus::Cancelled => Self::at(1.0, "cancelled"),
        }
    }
}

/// Terminal failure attached to a task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFault {
    pub code: ErrorCode,
    pub message: String,
}

impl TaskFault {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Fault recorded when a task exceeds its `max_duration_ms`.
    pub fn timeout(limit_ms: u64) -> Self {
        Self::new(
            ErrorCode::TimeoutError,
            format!("task exceeded max duration of {limit_ms}ms"),
        )
    }

    /// Fault recorded for tasks force-cancelled at shutdown.
    pub fn drain_deadline() -> Self {
        Self::new(
            ErrorCode::StateError,
            "still running when the shutdown drain deadline expired",
        )
    }

    pub fn is_timeout(&self) -> bool {
        self.code == ErrorCode::TimeoutError
    }
}

impl fmt::Display for TaskFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// In-memory description of one submitted task and its lifecycle state.
///
/// The opaque payload is intentionally not part of the record: it lives in the
/// scheduler while queued and is consumed by the worker at start, so records
/// stay cheap to clone and serialize.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub status: TaskStatus,
    pub config: ExecutionConfig,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Set exactly when `status` becomes terminal, never cleared.
    pub ended_at: Option<DateTime<Utc>>,
    pub progress: TaskProgress,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskFault>,
}

impl TaskRecord {
    /// Fresh record for a task accepted into the queue.
    pub fn queued(id: TaskId, config: ExecutionConfig) -> Self {
        Self {
            id,
            status: TaskStatus::Queued,
            config,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            progress: TaskProgress::for_status(TaskStatus::Queued),
            result: None,
            error: None,
        }
    }

    /// Milliseconds elapsed since the task reached a terminal status.
    /// `None` while the task is still queued or running.
    pub fn age_since_end_ms(&self, now: DateTime<Utc>) -> Option<i64> {
        self.ended_at
            .map(|ended| now.signed_duration_since(ended).num_milliseconds())
    }
}
