//! Stable re-exports for consumers (`cli` and external crates).
//!
//! Prefer importing from `taskmill_core::api` instead of reaching into internal modules.

pub use crate::config::{
    get_taskmill_data_dir, load_default, load_from_path, AppConfig, CleanupConfig, EngineConfig,
    LoggingConfig, MonitorConfig,
};
pub use crate::error::{EngineError, ErrorCode};
pub use crate::executor::types::{
    ExecutionConfig, Priority, ResourceLimits, TaskFault, TaskId, TaskProgress, TaskRecord,
    TaskStatus, MAX_TASK_DURATION_MS,
};
pub use crate::executor::{
    Admission, EngineBuilder, EngineStats, ExecutionObserver, ProgressReporter, QueueDepths,
    Refusal, RefusalKind, ResourceMonitor, ResourceSnapshot, SystemResourceMonitor, TaskContext,
    TaskEngine, TaskFn, TaskPayload, UnlimitedMonitor,
};
pub use crate::util::sanitize_log_text;
