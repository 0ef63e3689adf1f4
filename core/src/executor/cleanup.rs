//! Retention bookkeeping for finished task records.
//!
//! Records stay readable for a grace period after settling, then a
//! deferred one-shot delete removes them. Reading a finished record
//! postpones its delete, but only a bounded number of times, and a hard
//! age limit deletes regardless. An over-cap eviction removes the oldest
//! terminal records in batches so the map cannot grow without bound.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use super::types::{TaskId, TaskRecord};

/// A pending deferred delete for one finished record.
pub(crate) struct CleanupEntry {
    pub timer: JoinHandle<()>,
    /// Generation of the current timer. A firing timer only deletes when
    /// its generation still matches, so an aborted-but-already-elapsed
    /// timer cannot delete a record whose retention was just extended.
    pub epoch: u64,
    /// How many times reads have postponed the delete.
    pub cancels: u32,
}

impl CleanupEntry {
    pub fn new(timer: JoinHandle<()>, epoch: u64) -> Self {
        Self {
            timer,
            epoch,
            cancels: 0,
        }
    }

    pub fn abort(&self) {
        self.timer.abort();
    }
}

/// True when the record ended so long ago that it should be deleted now
/// instead of getting (another) grace period.
pub(crate) fn overdue(record: &TaskRecord, now: DateTime<Utc>, force_after_ms: u64) -> bool {
    record
        .age_since_end_ms(now)
        .map(|age| age > force_after_ms as i64)
        .unwrap_or(false)
}

/// Pick the oldest terminal records, up to `batch`, for forced eviction.
/// Running and queued tasks are never candidates.
pub(crate) fn eviction_batch(records: &HashMap<TaskId, TaskRecord>, batch: usize) -> Vec<TaskId> {
    let mut terminal: Vec<(&TaskId, DateTime<Utc>)> = records
        .iter()
        .filter_map(|(id, record)| record.ended_at.map(|ended| (id, ended)))
        .collect();
    terminal.sort_by_key(|(_, ended)| *ended);
    terminal
        .into_iter()
        .take(batch)
        .map(|(id, _)| id.clone())
        .collect()
}
