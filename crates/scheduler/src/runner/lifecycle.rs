use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::error::SchedulerError;
use crate::guard::on_job_thread;

use super::core::Shared;
use super::Scheduler;

/// Threads owned by a started scheduler.
pub(super) struct Runtime {
    pool: Arc<rayon::ThreadPool>,
    dispatcher: JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

impl Scheduler {
    fn lock_runtime(&self) -> MutexGuard<'_, Option<Runtime>> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.lock_runtime().is_some()
    }

    /// Build the worker pool and spawn the dispatcher thread.
    ///
    /// Calling `start` on a running scheduler logs a warning and does nothing.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut runtime = self.lock_runtime();
        if runtime.is_some() {
            warn!("scheduler already running");
            return Ok(());
        }

        let workers = self.shared.max_workers;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("task-worker-{i}"))
            .build()
            .map_err(|e| SchedulerError::WorkerPool(e.to_string()))?;
        let pool = Arc::new(pool);
        let stop = Arc::new(AtomicBool::new(false));

        let dispatcher = {
            let shared = Arc::clone(&self.shared);
            let pool = Arc::clone(&pool);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("task-dispatcher".into())
                .spawn(move || shared.dispatch_loop(&pool, &stop))
                .map_err(|e| SchedulerError::Dispatcher(e.to_string()))?
        };

        *runtime = Some(Runtime { pool, dispatcher, stop });
        info!(workers, "scheduler started");
        Ok(())
    }

    /// Stop dispatching.
    ///
    /// With `wait_for_completion` the call blocks until every dispatched task
    /// has been recorded. Without it, running tasks are asked to cancel and
    /// the call returns as soon as the dispatcher has exited. Queued tasks stay
    /// queued either way; a later [`start`](Self::start) picks them up.
    pub fn stop(&self, wait_for_completion: bool) {
        let Some(runtime) = self.lock_runtime().take() else {
            return;
        };
        info!(wait_for_completion, "stopping scheduler");

        runtime.stop.store(true, Ordering::SeqCst);
        self.shared.wake_dispatcher();

        if runtime.dispatcher.thread().id() == thread::current().id() {
            debug!("stop requested from the dispatcher thread; not joining it");
        } else if runtime.dispatcher.join().is_err() {
            error!("dispatcher thread panicked");
        }

        // Nothing new is dispatched past this point.
        if !wait_for_completion {
            self.shared.cancel_running();
        } else if runtime.pool.current_thread_index().is_some() || on_job_thread() {
            warn!("stop requested from a task thread; not waiting for running tasks");
        } else {
            self.shared.wait_idle();
        }

        info!("scheduler stopped");
    }
}

impl Shared {
    /// Ask every dispatched task to cancel. Locks are released before the
    /// tasks are touched so their observers can call back into the scheduler.
    pub(super) fn cancel_running(&self) {
        let running: Vec<_> = self
            .lock_state()
            .running
            .values()
            .map(|handle| Arc::clone(&handle.task))
            .collect();
        for task in running {
            task.cancel();
        }
    }

    /// Block until nothing is left in the running set.
    fn wait_idle(&self) {
        let mut state = self.lock_state();
        while !state.running.is_empty() {
            debug!(running = state.running.len(), "waiting for running tasks");
            state = self
                .finished
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}
