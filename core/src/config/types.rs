use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub cleanup: CleanupConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Knobs for the executor itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long shutdown waits for running tasks before force-cancelling.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Upper bound a task may request via `max_duration_ms`. Clamped to
    /// one hour regardless of what the file says.
    #[serde(default = "default_max_task_duration_ms")]
    pub max_task_duration_ms: u64,
}

fn default_drain_timeout_ms() -> u64 {
    10_000
}

fn default_max_task_duration_ms() -> u64 {
    60 * 60 * 1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: default_drain_timeout_ms(),
            max_task_duration_ms: default_max_task_duration_ms(),
        }
    }
}

/// Retention policy for finished task records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// How long a finished record stays readable before its deferred
    /// delete fires.
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,

    /// Records older than this since ending are deleted immediately, no
    /// matter how often they are read.
    #[serde(default = "default_force_after_ms")]
    pub force_after_ms: u64,

    /// Maximum records held in memory before the oldest terminal ones are
    /// evicted.
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,

    /// How many records one over-cap eviction removes.
    #[serde(default = "default_evict_batch")]
    pub evict_batch: usize,

    /// How many times reads may postpone a record's deferred delete.
    #[serde(default = "default_max_cleanup_cancels")]
    pub max_cleanup_cancels: u32,
}

fn default_retention_ms() -> u64 {
    60_000
}

fn default_force_after_ms() -> u64 {
    60 * 60 * 1000
}

fn default_history_cap() -> usize {
    1000
}

fn default_evict_batch() -> usize {
    100
}

fn default_max_cleanup_cancels() -> u32 {
    10
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            retention_ms: default_retention_ms(),
            force_after_ms: default_force_after_ms(),
            history_cap: default_history_cap(),
            evict_batch: default_evict_batch(),
            max_cleanup_cancels: default_max_cleanup_cancels(),
        }
    }
}

/// Thresholds for the system resource monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Task slots. Tasks beyond this wait in their queue.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Refuse to start tasks while system CPU usage is above this.
    #[serde(default = "default_max_cpu_percent")]
    pub max_cpu_percent: f32,

    /// Refuse to start tasks while free memory is below this.
    #[serde(default = "default_min_free_memory_mb")]
    pub min_free_memory_mb: u64,

    /// Minimum interval between sysinfo refreshes.
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
}

fn default_max_concurrent() -> usize {
    5
}

fn default_max_cpu_percent() -> f32 {
    90.0
}

fn default_min_free_memory_mb() -> u64 {
    512
}

fn default_refresh_interval_ms() -> u64 {
    1000
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_cpu_percent: default_max_cpu_percent(),
            min_free_memory_mb: default_min_free_memory_mb(),
            refresh_interval_ms: default_refresh_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_enabled")]
    pub enabled: bool,

    /// If true, log to stderr.
    #[serde(default = "default_logging_console")]
    pub console: bool,

    /// If true, log to a file under `directory` (or OS temp dir if unset).
    #[serde(default = "default_logging_file")]
    pub file: bool,

    /// EnvFilter string, e.g. "info" or "taskmill_core=debug".
    #[serde(default = "default_logging_level")]
    pub level: String,

    /// Optional directory for log files. If empty or unset, uses OS temp dir.
    #[serde(default)]
    pub directory: Option<String>,
}

fn default_logging_enabled() -> bool {
    true
}

fn default_logging_console() -> bool {
    true
}

fn default_logging_file() -> bool {
    true
}

fn default_logging_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: default_logging_enabled(),
            console: default_logging_console(),
            file: default_logging_file(),
            level: default_logging_level(),
            directory: None,
        }
    }
}
