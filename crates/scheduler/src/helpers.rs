//! Convenience wrappers over the [`Scheduler`] API.

use std::sync::PoisonError;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::SchedulerError;
use crate::result::TaskResult;
use crate::runner::Scheduler;
use crate::task::Task;
use crate::types::TaskId;

/// Submit `tasks` so each one depends on the one before it.
///
/// Returns the ids in submission order. If a submission fails, the tasks
/// already submitted stay in the scheduler.
pub fn chain_tasks(scheduler: &Scheduler, tasks: Vec<Task>) -> Result<Vec<TaskId>, SchedulerError> {
    let mut ids = Vec::with_capacity(tasks.len());
    for mut task in tasks {
        if let Some(prev) = ids.last() {
            task.add_dependency(*prev);
        }
        ids.push(scheduler.add_task(task)?);
    }
    debug!(len = ids.len(), "task chain submitted");
    Ok(ids)
}

/// Block until `id` has a recorded result, or `timeout` elapses.
///
/// Returns `None` on timeout, and immediately when the scheduler has never
/// heard of `id` (or has already evicted or removed it). `None` as timeout
/// waits indefinitely.
pub fn wait_for_task(scheduler: &Scheduler, id: &TaskId, timeout: Option<Duration>) -> Option<TaskResult> {
    let shared = &scheduler.shared;
    let slice = shared.config.wait_poll_interval();
    let deadline = timeout.map(|t| Instant::now() + t);

    let mut state = shared.lock_state();
    loop {
        if let Some(result) = state.completed.get(id) {
            return Some(result.clone());
        }
        if !state.is_live(id) {
            return None;
        }

        let wait = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return None;
                }
                slice.min(deadline - now)
            }
            None => slice,
        };
        state = shared
            .finished
            .wait_timeout(state, wait)
            .unwrap_or_else(PoisonError::into_inner)
            .0;
    }
}
