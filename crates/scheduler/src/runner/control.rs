use tracing::info;

use crate::error::TaskError;
use crate::types::{TaskId, TaskStatus};

use super::Scheduler;

impl Scheduler {
    /// Cancel a task.
    ///
    /// A queued task is settled as `Cancelled` right away and its result is
    /// retained. A running or paused task gets its cancellation flag set and
    /// is recorded once its worker returns. Returns `false` for unknown or
    /// already-finished tasks.
    pub fn cancel_task(&self, id: &TaskId) -> bool {
        let shared = &self.shared;
        let (task, settled) = {
            let mut state = shared.lock_state();
            let Some(task) = state.tasks.get(id).cloned() else {
                return false;
            };
            let settled = if state.running.contains_key(id) {
                None
            } else {
                task.settle_pending(TaskStatus::Cancelled, TaskError::Cancelled)
            };
            if let Some(result) = &settled {
                state.dequeue(id);
                state.record_result(result.clone(), shared.config.completed_capacity);
                state.wake_pending = true;
            }
            (task, settled)
        };

        match settled {
            Some(result) => {
                info!(task_id = %id, task = %task.name(), "queued task cancelled");
                shared.wake.notify_one();
                shared.finished.notify_all();
                task.announce(&result);
                true
            }
            None => task.cancel(),
        }
    }

    /// Pause a running task. The job stops at its next pause check.
    pub fn pause_task(&self, id: &TaskId) -> bool {
        self.get_task(id).is_some_and(|task| task.pause())
    }

    pub fn resume_task(&self, id: &TaskId) -> bool {
        self.get_task(id).is_some_and(|task| task.resume())
    }

    /// Forget a live task.
    ///
    /// The task leaves its queue and the running set; if it is running its
    /// cancellation flag is set and its eventual result is discarded. Results
    /// that were already recorded are not affected.
    pub fn remove_task(&self, id: &TaskId) -> bool {
        let shared = &self.shared;
        let task = {
            let mut state = shared.lock_state();
            let Some(task) = state.tasks.remove(id) else {
                return false;
            };
            state.dequeue(id);
            state.running.remove(id);
            state.stats.removed += 1;
            state.wake_pending = true;
            task
        };
        shared.wake.notify_one();
        shared.finished.notify_all();

        task.cancel();
        info!(task_id = %id, task = %task.name(), "task removed");
        true
    }
}
