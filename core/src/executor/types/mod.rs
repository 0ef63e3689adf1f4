mod config;
mod task;

pub use config::{ExecutionConfig, Priority, ResourceLimits, MAX_TASK_DURATION_MS};
pub use task::{TaskFault, TaskId, TaskProgress, TaskRecord, TaskStatus};
