//! Resource-aware background task execution.
//!
//! The engine accepts opaque async payloads, queues them by priority and
//! starts them only when the resource monitor admits them. Each running
//! task races its body against an optional hard timeout and a cooperative
//! cancellation flag; every accepted task settles exactly once. Finished
//! records remain readable for a retention window, then deferred cleanup
//! removes them so history cannot grow without bound.
//!
//! # Architecture
//!
//! ```text
//! submit(payload, config)
//!   ↓ validate limits, admission check
//! TaskScheduler { high, medium, low }
//!   ↓ scheduling pass (re-entrancy guarded)
//! worker: payload ⊻ timeout ⊻ cancellation
//!   ↓ settle exactly once
//! TaskRecord { Completed | Failed | Cancelled }
//!   ↓ retention window
//! deferred cleanup / history-cap eviction
//! ```

mod cleanup;
mod engine;
pub mod monitor;
mod progress;
mod results;
mod scheduler;
mod task;
pub mod types;

pub use engine::{EngineBuilder, EngineStats, QueueDepths, TaskEngine};
pub use monitor::{
    Admission, Refusal, RefusalKind, ResourceMonitor, ResourceSnapshot, SystemResourceMonitor,
    UnlimitedMonitor,
};
pub use progress::ExecutionObserver;
pub use task::{ProgressReporter, TaskContext, TaskFn, TaskPayload};
