use std::collections::VecDeque;
use std::fmt;

use super::monitor::{Admission, Refusal, ResourceMonitor};
use super::task::TaskPayload;
use super::types::{Priority, ResourceLimits, TaskId};

/// A submitted task waiting to start. The payload lives here, not in the
/// task record, so history never keeps closures alive.
pub(crate) struct QueuedTask {
    pub id: TaskId,
    pub limits: ResourceLimits,
    pub payload: Box<dyn TaskPayload>,
}

impl fmt::Debug for QueuedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedTask")
            .field("id", &self.id)
            .field("limits", &self.limits)
            .finish()
    }
}

/// What a scheduling pass should do next.
#[derive(Debug)]
pub(crate) enum Dispatch {
    /// Start this task now.
    Task(QueuedTask),
    /// The head of the highest non-empty queue cannot start. Nothing lower
    /// may jump it, so the pass ends here.
    Blocked { id: TaskId, refusal: Refusal },
    /// No tasks are waiting.
    Idle,
}

/// Three FIFO queues, one per priority level. Not synchronized itself, it
/// lives inside the engine's state lock.
#[derive(Default)]
pub(crate) struct TaskScheduler {
    queues: [VecDeque<QueuedTask>; 3],
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn index(priority: Priority) -> usize {
        match priority {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }

    pub fn enqueue(&mut self, priority: Priority, entry: QueuedTask) {
        self.queues[Self::index(priority)].push_back(entry);
    }

    /// Pick the next task to start. Only the head of the highest non-empty
    /// queue is considered: if the monitor refuses it, lower-priority work
    /// stays parked behind it.
    pub fn next_runnable(&mut self, monitor: &dyn ResourceMonitor) -> Dispatch {
        for priority in Priority::SCHEDULING_ORDER {
            let queue = &mut self.queues[Self::index(priority)];
            let Some(head) = queue.front() else {
                continue;
            };

            return match monitor.admit(&head.limits) {
                Admission::Run => match queue.pop_front() {
                    Some(entry) => Dispatch::Task(entry),
                    None => Dispatch::Idle,
                },
                Admission::Refuse(refusal) => Dispatch::Blocked {
                    id: head.id.clone(),
                    refusal,
                },
            };
        }

        Dispatch::Idle
    }

    /// Pull a queued task out by id, e.g. when it is cancelled before it
    /// ever ran.
    pub fn remove(&mut self, id: &TaskId) -> Option<QueuedTask> {
        for queue in &mut self.queues {
            if let Some(pos) = queue.iter().position(|entry| &entry.id == id) {
                return queue.remove(pos);
            }
        }
        None
    }

    /// Empty every queue, highest priority first. Used during shutdown to
    /// settle never-started tasks as cancelled.
    pub fn drain(&mut self) -> Vec<QueuedTask> {
        let mut drained = Vec::with_capacity(self.len());
        for queue in &mut self.queues {
            drained.extend(queue.drain(..));
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }

    /// Queue depths in scheduling order (high, medium, low).
    pub fn depths(&self) -> [usize; 3] {
        [
            self.queues[0].len(),
            self.queues[1].len(),
            self.queues[2].len(),
        ]
    }
}
