use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::executor::monitor::Refusal;
use crate::executor::types::{TaskId, TaskStatus};

/// Stable error classes carried on task faults and API errors. The numeric
/// value doubles as the CLI process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    Success = 0,
    /// Payload returned an error of its own.
    TaskFailed = 1,
    ValidationError = 3,
    NotFoundError = 10,
    StateError = 20,
    TimeoutError = 30,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Errors returned synchronously by the engine API. Faults that settle a
/// task (timeouts, payload failures) are recorded on the task instead.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid {field}: {reason}")]
    InvalidLimit {
        field: &'static str,
        reason: String,
    },

    #[error("task rejected: {}", refusal.reason)]
    Rejected { refusal: Refusal },

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task {id} is already {status}")]
    InvalidState { id: TaskId, status: TaskStatus },

    #[error("engine is shutting down, new tasks are not accepted")]
    Draining,
}

impl EngineError {
    /// Map an API error to its stable class.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidLimit { .. } => ErrorCode::ValidationError,
            Self::Rejected { .. } => ErrorCode::ValidationError,
            Self::NotFound(_) => ErrorCode::NotFoundError,
            Self::InvalidState { .. } => ErrorCode::StateError,
            Self::Draining => ErrorCode::StateError,
        }
    }
}
