use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use taskmill_core::api::{ExecutionObserver, TaskId, TaskStatus};

/// Visual board of per-task progress bars.
///
/// Implements the engine's observer interface, so it hears lifecycle and
/// progress events as they happen. Disabled boards swallow every event,
/// leaving log output untouched.
pub struct TaskBoard {
    multi: MultiProgress,
    bars: Mutex<HashMap<TaskId, ProgressBar>>,
    enabled: bool,
}

impl TaskBoard {
    pub fn new(enabled: bool) -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
            enabled,
        }
    }

    fn add_bar(&self, id: &TaskId) {
        let bar = self.multi.add(ProgressBar::new(100));
        bar.set_style(
            ProgressStyle::default_bar()
                .template("  {spinner:.green} {bar:30.cyan/blue} {pos:>3}% {msg}")
                .unwrap()
                .progress_chars("█▓▒░  "),
        );
        bar.set_message(format!("⏳ {id} queued"));
        bar.enable_steady_tick(Duration::from_millis(100));

        let mut bars = match self.bars.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        bars.insert(id.clone(), bar);
    }

    fn with_bar(&self, id: &TaskId, f: impl FnOnce(&ProgressBar)) {
        let bars = match self.bars.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(bar) = bars.get(id) {
            f(bar);
        }
    }

    /// Clear the board once the run is over.
    pub fn finish(&self) {
        if !self.enabled {
            return;
        }
        let bars = match self.bars.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for bar in bars.values() {
            if !bar.is_finished() {
                bar.finish();
            }
        }
        let _ = self.multi.clear();
    }
}

impl ExecutionObserver for TaskBoard {
    fn on_progress(&self, id: &TaskId, fraction: f64, stage: &str) {
        if !self.enabled {
            return;
        }
        self.with_bar(id, |bar| {
            bar.set_position((fraction * 100.0) as u64);
            bar.set_message(format!("{id} {stage}"));
        });
    }

    fn on_lifecycle(&self, id: &TaskId, status: TaskStatus) {
        if !self.enabled {
            return;
        }
        match status {
            TaskStatus::Queued => self.add_bar(id),
            TaskStatus::Running => {
                self.with_bar(id, |bar| bar.set_message(format!("{id} running")));
            }
            TaskStatus::Completed => {
                self.with_bar(id, |bar| {
                    bar.set_position(100);
                    bar.finish_with_message(format!("✅ {id}"));
                });
            }
            TaskStatus::Failed => {
                self.with_bar(id, |bar| bar.finish_with_message(format!("❌ {id}")));
            }
            TaskStatus::Cancelled => {
                self.with_bar(id, |bar| bar.finish_with_message(format!("🚫 {id}")));
            }
        }
    }
}
