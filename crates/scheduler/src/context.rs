//! Cooperative control signals shared between a task, its supervisor and
//! the job running on the guard thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::JobError;
use crate::task::TaskCore;
use crate::types::TaskId;

/// Cancellation and pause flags for one task.
///
/// Kept apart from the task's state mutex so a job checking its flags never
/// blocks behind a long-held state lock.
#[derive(Debug, Default)]
pub(crate) struct TaskSignals {
    cancelled: AtomicBool,
    paused: Mutex<bool>,
    wake: Condvar,
}

impl TaskSignals {
    fn paused_guard(&self) -> MutexGuard<'_, bool> {
        self.paused.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Request cancellation and wake anything parked on the pause flag.
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.wake_all();
    }

    /// Wake every waiter so it re-checks its stop conditions.
    pub(crate) fn wake_all(&self) {
        let _guard = self.paused_guard();
        self.wake.notify_all();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn should_stop(&self, attempt: Option<&AttemptToken>) -> bool {
        self.is_cancelled() || attempt.is_some_and(AttemptToken::is_abandoned)
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        let mut guard = self.paused_guard();
        *guard = paused;
        if !paused {
            self.wake.notify_all();
        }
    }

    pub(crate) fn is_paused(&self) -> bool {
        *self.paused_guard()
    }

    /// Block while paused. Returns early once cancellation is requested or
    /// `attempt` is abandoned.
    pub(crate) fn wait_while_paused(&self, attempt: Option<&AttemptToken>) {
        let mut guard = self.paused_guard();
        while *guard && !self.should_stop(attempt) {
            guard = self.wake.wait(guard).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Sleep for `duration` unless stopped first. Returns `false` when stopped.
    pub(crate) fn sleep_unless_cancelled(
        &self,
        duration: Duration,
        attempt: Option<&AttemptToken>,
    ) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = self.paused_guard();
        loop {
            if self.should_stop(attempt) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            guard = self
                .wake
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Stop signal scoped to one execution attempt.
///
/// The guard trips it when it gives up on an attempt (timeout or cancel), so
/// the job sees `is_cancelled()` while the task-level cancel flag stays clear.
/// The job thread marks it exited when `execute` returns.
#[derive(Debug, Default)]
pub(crate) struct AttemptToken {
    abandoned: AtomicBool,
    exited: Mutex<bool>,
    exit: Condvar,
}

impl AttemptToken {
    pub(crate) fn abandon(&self) {
        self.abandoned.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_exited(&self) {
        *self.exited.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.exit.notify_all();
    }

    /// Wait up to `grace` for the job thread to return. Returns whether it did.
    pub(crate) fn wait_exited(&self, grace: Duration) -> bool {
        let guard = self.exited.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .exit
            .wait_timeout_while(guard, grace, |exited| !*exited)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Handle given to a [`Job`](crate::Job) while it executes.
///
/// Jobs must call [`checkpoint`](Self::checkpoint) (or poll
/// [`is_cancelled`](Self::is_cancelled)) at their internal loop boundaries.
/// Each attempt gets its own context. Once the attempt times out or is
/// cancelled, `is_cancelled` turns true and waits return early, but the job's
/// thread only exits when the job itself returns.
#[derive(Clone)]
pub struct TaskContext {
    core: Arc<TaskCore>,
    attempt: Arc<AttemptToken>,
}

impl TaskContext {
    /// Context for a fresh attempt.
    pub(crate) fn new(core: Arc<TaskCore>) -> Self {
        Self {
            core,
            attempt: Arc::new(AttemptToken::default()),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.core.id
    }

    pub fn task_name(&self) -> &str {
        &self.core.name
    }

    /// True once the task is cancelled or this attempt was given up on.
    pub fn is_cancelled(&self) -> bool {
        self.core.signals.is_cancelled() || self.attempt.is_abandoned()
    }

    pub fn is_paused(&self) -> bool {
        self.core.signals.is_paused()
    }

    /// Block until the task is resumed (or cancelled).
    pub fn wait_if_paused(&self) {
        if self.core.signals.is_paused() {
            tracing::debug!(task_id = %self.core.id, task = %self.core.name, "waiting for resume");
        }
        self.core.signals.wait_while_paused(Some(&self.attempt));
    }

    /// Safe point for cooperative control: waits out a pause, then fails
    /// with [`JobError::Cancelled`] if cancellation was requested.
    pub fn checkpoint(&self) -> Result<(), JobError> {
        self.wait_if_paused();
        if self.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        Ok(())
    }

    /// Sleep that wakes early on cancellation.
    pub fn sleep(&self, duration: Duration) -> Result<(), JobError> {
        if self.core.signals.sleep_unless_cancelled(duration, Some(&self.attempt)) {
            Ok(())
        } else {
            Err(JobError::Cancelled)
        }
    }

    /// Report progress (clamped to 0..=100) with an optional message.
    /// Ignored once this attempt has been abandoned.
    pub fn update_progress(&self, progress: f64, message: Option<&str>) {
        if self.attempt.is_abandoned() {
            return;
        }
        self.core.update_progress(progress, message);
    }

    /// Give up on this attempt and wake the job out of any wait.
    pub(crate) fn abandon(&self) {
        self.attempt.abandon();
        self.core.signals.wake_all();
    }

    pub(crate) fn attempt(&self) -> &AttemptToken {
        &self.attempt
    }
}
