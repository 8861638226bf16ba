use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Instant;

use tracing::{debug, error, warn};

use crate::error::{panic_message, TaskError};
use crate::result::TaskResult;
use crate::task::Task;
use crate::types::{Priority, TaskStatus};

use super::core::{RunningHandle, SchedulerState, Shared};

/// Dependency verdict for a queued task.
#[derive(Debug)]
enum Readiness {
    Ready,
    Waiting,
    /// A dependency can no longer complete.
    Doomed(TaskError),
}

/// Check every dependency of `task` against live tasks and retained results.
fn readiness(state: &SchedulerState, task: &Task) -> Readiness {
    let mut waiting = false;
    for dep in task.dependencies() {
        let status = if let Some(live) = state.tasks.get(dep) {
            live.status()
        } else if let Some(result) = state.completed.get(dep) {
            result.status
        } else {
            return Readiness::Doomed(TaskError::DependencyMissing(*dep));
        };

        match status {
            TaskStatus::Completed => {}
            status if status.is_terminal() => {
                return Readiness::Doomed(TaskError::DependencyFailed {
                    dependency: *dep,
                    status,
                });
            }
            _ => waiting = true,
        }
    }
    if waiting {
        Readiness::Waiting
    } else {
        Readiness::Ready
    }
}

impl Shared {
    /// Dispatcher thread body. Runs one cycle per wake-up (or per
    /// `dispatch_interval` when idle) until `stop` is set.
    pub(super) fn dispatch_loop(self: &Arc<Self>, pool: &rayon::ThreadPool, stop: &AtomicBool) {
        debug!("dispatcher started");
        while !stop.load(Ordering::SeqCst) {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.dispatch_cycle(pool))) {
                error!("dispatch cycle panicked: {}", panic_message(&*payload));
            }
            self.wait_for_wake(stop);
        }
        debug!("dispatcher stopped");
    }

    fn wait_for_wake(&self, stop: &AtomicBool) {
        let mut state = self.lock_state();
        if !state.wake_pending && !stop.load(Ordering::SeqCst) {
            state = self
                .wake
                .wait_timeout(state, self.config.dispatch_interval())
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        state.wake_pending = false;
    }

    /// One pass: settle queued tasks that can never run, then hand ready
    /// tasks to the pool in priority order while worker slots are free.
    fn dispatch_cycle(self: &Arc<Self>, pool: &rayon::ThreadPool) {
        let mut doomed = Vec::new();
        let mut dispatched = Vec::new();
        let settled_any;
        {
            let mut state = self.lock_state();
            settled_any = self.settle_queued(&mut state, &mut doomed);

            for priority in Priority::DESCENDING {
                let queue = priority.index();
                let mut idx = 0;
                while state.running.len() < self.max_workers && idx < state.queues[queue].len() {
                    let entry = state.queues[queue][idx];
                    let Some(task) = state.tasks.get(&entry.id).cloned() else {
                        state.queues[queue].remove(idx);
                        continue;
                    };
                    match readiness(&state, &task) {
                        Readiness::Ready => {
                            state.queues[queue].remove(idx);
                            debug!(
                                task_id = %entry.id,
                                task = %task.name(),
                                %priority,
                                seq = entry.seq,
                                queued = ?entry.enqueued_at.elapsed(),
                                "dispatching task"
                            );
                            state.running.insert(
                                entry.id,
                                RunningHandle {
                                    task: Arc::clone(&task),
                                    dispatched_at: Instant::now(),
                                },
                            );
                            dispatched.push(task);
                        }
                        // Blocked entries keep their place in the queue.
                        Readiness::Waiting | Readiness::Doomed(_) => idx += 1,
                    }
                }
            }
        }

        for (task, result) in &doomed {
            task.announce(result);
        }
        if settled_any {
            self.finished.notify_all();
        }

        for task in dispatched {
            let shared = Arc::clone(self);
            pool.spawn(move || shared.execute(task));
        }
    }

    /// Move terminal or doomed queued tasks into `completed`, repeating until
    /// nothing changes so failures cascade down dependency chains in one cycle.
    ///
    /// Tasks failed here are pushed to `doomed`; their observers fire once the
    /// lock is released. Tasks cancelled directly through their handle already
    /// announced themselves.
    fn settle_queued(
        &self,
        state: &mut SchedulerState,
        doomed: &mut Vec<(Arc<Task>, TaskResult)>,
    ) -> bool {
        let capacity = self.config.completed_capacity;
        let mut settled_any = false;
        loop {
            let mut changed = false;
            for queue in 0..state.queues.len() {
                let mut idx = 0;
                while idx < state.queues[queue].len() {
                    let id = state.queues[queue][idx].id;
                    let Some(task) = state.tasks.get(&id).cloned() else {
                        state.queues[queue].remove(idx);
                        continue;
                    };

                    let settled = if task.status().is_terminal() {
                        Some(task.result())
                    } else if let Readiness::Doomed(reason) = readiness(state, &task) {
                        warn!(task_id = %id, task = %task.name(), "{}", reason);
                        task.settle_pending(TaskStatus::Failed, reason).map(|result| {
                            doomed.push((Arc::clone(&task), result.clone()));
                            result
                        })
                    } else {
                        None
                    };

                    match settled {
                        Some(result) => {
                            state.queues[queue].remove(idx);
                            state.record_result(result, capacity);
                            changed = true;
                        }
                        None => idx += 1,
                    }
                }
            }
            if !changed {
                return settled_any;
            }
            settled_any = true;
        }
    }
}
