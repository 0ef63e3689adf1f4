//! Resource-aware background task execution.
//!
//! `taskmill-core` hosts the task engine: priority scheduling with
//! resource-gated admission, cooperative cancellation raced against hard
//! timeouts, and deferred cleanup of finished task history.

pub mod api;
pub mod config;
pub mod error;
pub mod executor;
pub mod util;
