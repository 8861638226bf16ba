use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error};

use crate::error::{panic_message, TaskError};
use crate::result::TaskResult;
use crate::task::Task;

use super::core::Shared;

impl Shared {
    /// Worker body: run the task and record whatever it ended as.
    pub(super) fn execute(&self, task: Arc<Task>) {
        let result = match panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(&*payload);
                error!(task_id = %task.id(), task = %task.name(), "worker panicked: {}", message);
                task.abort(TaskError::WorkerPanic(message))
            }
        };
        self.finish(result);
    }

    /// Record a worker's result and wake the dispatcher and any waiters.
    ///
    /// Results of tasks removed while running are dropped.
    fn finish(&self, result: TaskResult) {
        let id = result.task_id;
        {
            let mut state = self.lock_state();
            let held = state.running.get(&id).map(|handle| handle.dispatched_at.elapsed());
            if state.tasks.contains_key(&id) {
                debug!(task_id = %id, status = %result.status, ?held, "recording result");
                state.record_result(result, self.config.completed_capacity);
            } else {
                state.running.remove(&id);
                debug!(task_id = %id, "discarding result of removed task");
            }
            state.wake_pending = true;
        }
        self.wake.notify_one();
        self.finished.notify_all();
    }
}
