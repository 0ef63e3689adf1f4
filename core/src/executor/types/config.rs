use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

use super::super::progress::ExecutionObserver;

/// Hard ceiling on `max_duration_ms` (one hour). Configurable downward via
/// `EngineConfig::max_task_duration_ms`, never upward past this.
pub const MAX_TASK_DURATION_MS: u64 = 60 * 60 * 1000;

/// Scheduling priority. FIFO within a level, strict ordering across levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// Dequeue inspection order: a blocked higher level shadows lower ones.
    pub const SCHEDULING_ORDER: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// Per-task resource limits checked at submission and at dispatch.
///
/// The u64/f32 types make the serde boundary strict: negative, non-integral
/// or non-finite durations are rejected during deserialization, before
/// `validate` ever runs.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Wall-clock budget for one execution. `None` means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_ms: Option<u64>,

    /// Refuse to start while system CPU usage is above this percentage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu_percent: Option<f32>,

    /// Minimum free memory (MB) required to start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_mb: Option<u64>,
}

impl ResourceLimits {
    /// Validate against the engine's duration cap. Every violation maps to
    /// the `ValidationError` class so submitters see it synchronously.
    pub fn validate(&self, duration_cap_ms: u64) -> Result<(), EngineError> {
        let cap = duration_cap_ms.min(MAX_TASK_DURATION_MS);

        if let Some(ms) = self.max_duration_ms {
            if ms == 0 || ms > cap {
                return Err(EngineError::InvalidLimit {
                    field: "max_duration_ms",
                    reason: format!("must be between 1 and {cap}, got {ms}"),
                });
            }
        }

        if let Some(pct) = self.max_cpu_percent {
            // The comparison is written so NaN fails it as well.
            if !(pct > 0.0 && pct <= 100.0) {
                return Err(EngineError::InvalidLimit {
                    field: "max_cpu_percent",
                    reason: format!("must be within (0, 100], got {pct}"),
                });
            }
        }

        if let Some(mb) = self.max_memory_mb {
            if mb == 0 {
                return Err(EngineError::InvalidLimit {
                    field: "max_memory_mb",
                    reason: "must be at least 1".to_string(),
                });
            }
        }

        Ok(())
    }
}

/// Everything a submitter can attach to one task.
#[derive(Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_priority")]
    pub priority: Priority,

    #[serde(default)]
    pub limits: ResourceLimits,

    /// Optional per-task observer, notified in addition to the engine-wide
    /// one. Never serialized; absent after deserialization.
    #[serde(skip)]
    pub callbacks: Option<Arc<dyn ExecutionObserver>>,
}

fn default_priority() -> Priority {
    Priority::Medium
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            priority: default_priority(),
            limits: ResourceLimits::default(),
            callbacks: None,
        }
    }
}

impl ExecutionConfig {
    pub fn with_priority(priority: Priority) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    pub fn max_duration_ms(mut self, ms: u64) -> Self {
        self.limits.max_duration_ms = Some(ms);
        self
    }

    pub fn max_cpu_percent(mut self, pct: f32) -> Self {
        self.limits.max_cpu_percent = Some(pct);
        self
    }

    pub fn max_memory_mb(mut self, mb: u64) -> Self {
        self.limits.max_memory_mb = Some(mb);
        self
    }

    pub fn callbacks(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.callbacks = Some(observer);
        self
    }

    pub fn validate(&self, duration_cap_ms: u64) -> Result<(), EngineError> {
        self.limits.validate(duration_cap_ms)
    }
}

impl fmt::Debug for ExecutionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionConfig")
            .field("priority", &self.priority)
            .field("limits", &self.limits)
            .field("callbacks", &self.callbacks.is_some())
            .finish()
    }
}
