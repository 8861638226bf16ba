use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::context::{TaskContext, TaskSignals};
use crate::error::{panic_message, JobError, TaskError};
use crate::guard::{run_guarded, GuardOutcome};
use crate::result::{TaskInfo, TaskResult};
use crate::types::{Payload, Priority, TaskId, TaskStatus};

/// Timeout used when neither the task nor the scheduler sets one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
/// Base retry delay used when neither the task nor the scheduler sets one.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);
/// Guard poll interval used outside a scheduler.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The work wrapped by a [`Task`].
///
/// `execute` runs on a dedicated thread. Cancellation and timeouts are
/// cooperative: the scheduler stops waiting and marks the task terminal, but
/// it cannot stop the thread. Implementations must call
/// [`TaskContext::checkpoint`] at loop boundaries (and between blocking
/// steps) and return promptly once it fails, otherwise an abandoned job keeps
/// its thread alive until it finishes on its own.
pub trait Job: Send + Sync + 'static {
    fn execute(&self, ctx: &TaskContext) -> Result<Payload, JobError>;
}

impl<F> Job for F
where
    F: Fn(&TaskContext) -> Result<Payload, JobError> + Send + Sync + 'static,
{
    fn execute(&self, ctx: &TaskContext) -> Result<Payload, JobError> {
        self(ctx)
    }
}

/// Scheduling parameters of a task. Fixed once the task is submitted.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub priority: Priority,
    /// Per-attempt timeout. `None` takes the scheduler default.
    pub timeout: Option<Duration>,
    /// Extra attempts after a failed or timed-out one.
    pub retry_count: u32,
    /// Delay before the first retry; doubles for each further retry.
    pub retry_backoff: Option<Duration>,
    pub dependencies: Vec<TaskId>,
    /// How often the guard re-checks cancellation while the job runs.
    pub poll_interval: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            timeout: None,
            retry_count: 0,
            retry_backoff: None,
            dependencies: Vec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl TaskConfig {
    pub fn effective_timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT)
    }

    fn effective_backoff(&self) -> Duration {
        self.retry_backoff.unwrap_or(DEFAULT_RETRY_BACKOFF)
    }
}

// ── Observers ────────────────────────────────────────────────

type ProgressFn = Box<dyn Fn(f64) + Send + Sync>;
type StatusFn = Box<dyn Fn(TaskStatus) + Send + Sync>;
type CompleteFn = Box<dyn Fn(&TaskResult) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Observers {
    on_progress: Option<ProgressFn>,
    on_status_change: Option<StatusFn>,
    on_complete: Option<CompleteFn>,
}

// ── Shared task core ─────────────────────────────────────────

#[derive(Debug)]
pub(crate) struct TaskState {
    pub(crate) status: TaskStatus,
    pub(crate) progress: f64,
    pub(crate) start_time: Option<DateTime<Utc>>,
    pub(crate) end_time: Option<DateTime<Utc>>,
    started: Option<Instant>,
    pub(crate) execution_time: Duration,
    pub(crate) error: Option<String>,
    pub(crate) data: Payload,
    pub(crate) metadata: Payload,
}

impl TaskState {
    fn new() -> Self {
        Self {
            status: TaskStatus::Pending,
            progress: 0.0,
            start_time: None,
            end_time: None,
            started: None,
            execution_time: Duration::ZERO,
            error: None,
            data: Payload::new(),
            metadata: Payload::new(),
        }
    }

    /// Move into a terminal status and stamp end time / elapsed.
    fn finish(&mut self, status: TaskStatus, error: Option<String>, data: Option<Payload>) {
        self.status = status;
        if error.is_some() {
            self.error = error;
        }
        if let Some(data) = data {
            self.data = data;
            self.progress = 100.0;
        }
        self.end_time = Some(Utc::now());
        self.execution_time = self.started.map(|s| s.elapsed()).unwrap_or(Duration::ZERO);
    }
}

/// State shared between a [`Task`] and the [`TaskContext`] handed to its job.
pub(crate) struct TaskCore {
    pub(crate) id: TaskId,
    pub(crate) name: String,
    pub(crate) state: Mutex<TaskState>,
    pub(crate) signals: TaskSignals,
    observers: Observers,
}

impl TaskCore {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn update_progress(&self, progress: f64, message: Option<&str>) {
        let progress = {
            let mut state = self.lock_state();
            if state.status.is_terminal() {
                return;
            }
            state.progress = progress.clamp(0.0, 100.0);
            if let Some(message) = message.filter(|m| !m.is_empty()) {
                state.metadata.insert("progress_message".into(), message.into());
            }
            state.progress
        };

        if let Some(cb) = &self.observers.on_progress {
            self.guard_observer("progress", || cb(progress));
        }
    }

    fn notify_status(&self, status: TaskStatus) {
        if let Some(cb) = &self.observers.on_status_change {
            self.guard_observer("status", || cb(status));
        }
    }

    fn notify_complete(&self, result: &TaskResult) {
        if let Some(cb) = &self.observers.on_complete {
            self.guard_observer("completion", || cb(result));
        }
    }

    /// Observers run outside every lock; a panicking observer is logged only.
    fn guard_observer(&self, kind: &str, f: impl FnOnce()) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
            error!(
                task_id = %self.id,
                task = %self.name,
                "{} observer panicked: {}",
                kind,
                panic_message(&*payload)
            );
        }
    }

    fn snapshot_locked(&self, state: &TaskState) -> TaskResult {
        TaskResult {
            task_id: self.id,
            name: self.name.clone(),
            status: state.status,
            data: state.data.clone(),
            error: state.error.clone(),
            execution_time: state.execution_time,
            start_time: state.start_time,
            end_time: state.end_time,
            progress: state.progress,
            metadata: state.metadata.clone(),
        }
    }

    fn snapshot(&self) -> TaskResult {
        let state = self.lock_state();
        self.snapshot_locked(&state)
    }

    /// Finish a started task. Ignored if it already reached a terminal state.
    fn finish(&self, status: TaskStatus, error: Option<String>, data: Option<Payload>) -> bool {
        {
            let mut state = self.lock_state();
            if !state.status.can_transition_to(status) {
                return false;
            }
            state.finish(status, error, data);
        }
        self.notify_status(status);
        true
    }
}

// ── Task ─────────────────────────────────────────────────────

/// A schedulable unit of work with its own state machine.
///
/// Built with [`Task::builder`]. Observers and dependencies are configured
/// while the caller still owns the task; after submission the scheduler
/// shares it behind an `Arc`.
pub struct Task {
    core: Arc<TaskCore>,
    description: String,
    config: TaskConfig,
    job: Arc<dyn Job>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.core.id)
            .field("name", &self.core.name)
            .field("config", &self.config)
            .field("status", &self.status())
            .finish()
    }
}

impl Task {
    pub fn builder(name: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(name)
    }

    pub fn id(&self) -> TaskId {
        self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub(crate) fn config_mut(&mut self) -> &mut TaskConfig {
        &mut self.config
    }

    pub fn priority(&self) -> Priority {
        self.config.priority
    }

    pub fn dependencies(&self) -> &[TaskId] {
        &self.config.dependencies
    }

    /// Append a dependency. Only possible before submission.
    pub fn add_dependency(&mut self, id: TaskId) {
        if !self.config.dependencies.contains(&id) {
            self.config.dependencies.push(id);
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.core.lock_state().status
    }

    pub fn progress(&self) -> f64 {
        self.core.lock_state().progress
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.signals.is_cancelled()
    }

    pub fn is_paused(&self) -> bool {
        self.core.signals.is_paused()
    }

    pub fn wait_if_paused(&self) {
        self.core.signals.wait_while_paused(None);
    }

    pub fn update_progress(&self, progress: f64, message: Option<&str>) {
        self.core.update_progress(progress, message);
    }

    /// Handle for the job: flags, progress reporting.
    pub fn context(&self) -> TaskContext {
        TaskContext::new(Arc::clone(&self.core))
    }

    pub(crate) fn job(&self) -> Arc<dyn Job> {
        Arc::clone(&self.job)
    }

    /// Current state as a result snapshot.
    pub fn result(&self) -> TaskResult {
        self.core.snapshot()
    }

    pub fn info(&self) -> TaskInfo {
        let state = self.core.lock_state();
        TaskInfo {
            task_id: self.core.id,
            name: self.core.name.clone(),
            description: self.description.clone(),
            priority: self.config.priority,
            status: state.status,
            progress: state.progress,
            timeout: self.config.effective_timeout(),
            retry_count: self.config.retry_count,
            dependencies: self.config.dependencies.clone(),
            start_time: state.start_time,
            end_time: state.end_time,
            execution_time: state.execution_time,
            error: state.error.clone(),
            metadata: state.metadata.clone(),
        }
    }

    /// Execute the task once, enforcing its timeout, retries and cancellation.
    ///
    /// Only a `Pending` task runs; any other call returns the current
    /// snapshot without side effects.
    pub fn run(&self) -> TaskResult {
        {
            let mut state = self.core.lock_state();
            if state.status != TaskStatus::Pending {
                warn!(
                    task_id = %self.core.id,
                    task = %self.core.name,
                    status = %state.status,
                    "run requested for task that is not pending"
                );
                return self.core.snapshot_locked(&state);
            }
            state.status = TaskStatus::Running;
            state.start_time = Some(Utc::now());
            state.started = Some(Instant::now());
            state.progress = 0.0;
        }
        self.core.notify_status(TaskStatus::Running);

        if self.core.signals.is_cancelled() {
            self.core
                .finish(TaskStatus::Cancelled, Some(TaskError::Cancelled.to_string()), None);
            return self.complete();
        }

        info!(task_id = %self.core.id, task = %self.core.name, "task started");
        let outcome = self.execute_attempts();

        match outcome {
            _ if self.core.signals.is_cancelled() => {
                self.core
                    .finish(TaskStatus::Cancelled, Some(TaskError::Cancelled.to_string()), None);
            }
            GuardOutcome::Cancelled | GuardOutcome::Finished(Err(JobError::Cancelled)) => {
                self.core
                    .finish(TaskStatus::Cancelled, Some(TaskError::Cancelled.to_string()), None);
            }
            GuardOutcome::TimedOut(limit) => {
                error!(task_id = %self.core.id, task = %self.core.name, ?limit, "task timed out");
                self.core
                    .finish(TaskStatus::Timeout, Some(TaskError::Timeout(limit).to_string()), None);
            }
            GuardOutcome::Finished(Err(e)) => {
                let err = TaskError::Execution {
                    task: self.core.name.clone(),
                    message: e.to_string(),
                };
                error!(task_id = %self.core.id, "{}", err);
                self.core.finish(TaskStatus::Failed, Some(err.to_string()), None);
            }
            GuardOutcome::Finished(Ok(data)) => {
                self.core.finish(TaskStatus::Completed, None, Some(data));
            }
        }

        self.complete()
    }

    fn execute_attempts(&self) -> GuardOutcome {
        let max_attempts = self.config.retry_count.saturating_add(1);
        let timeout = self.config.effective_timeout();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            self.core
                .lock_state()
                .metadata
                .insert("attempts".into(), attempt.into());

            let ctx = self.context();
            let outcome = run_guarded(self.job(), ctx.clone(), timeout, self.config.poll_interval);

            let retryable = match &outcome {
                GuardOutcome::TimedOut(_) => true,
                GuardOutcome::Finished(Err(JobError::Cancelled)) => false,
                GuardOutcome::Finished(Err(_)) => true,
                _ => false,
            };
            if !retryable || attempt >= max_attempts || self.core.signals.is_cancelled() {
                return outcome;
            }

            let delay = self
                .config
                .effective_backoff()
                .saturating_mul(1u32 << (attempt - 1).min(16));

            // A timed-out attempt must be gone before the next one starts.
            if matches!(outcome, GuardOutcome::TimedOut(_))
                && !ctx.attempt().wait_exited(delay.max(self.config.poll_interval))
            {
                warn!(
                    task_id = %self.core.id,
                    task = %self.core.name,
                    attempt,
                    "timed-out attempt ignored its stop signal, not retrying"
                );
                return outcome;
            }

            warn!(
                task_id = %self.core.id,
                task = %self.core.name,
                attempt,
                max_attempts,
                ?delay,
                "attempt failed, retrying"
            );
            if !self.core.signals.sleep_unless_cancelled(delay, None) {
                return GuardOutcome::Cancelled;
            }
        }
    }

    /// Snapshot the final state and fire the completion observer.
    fn complete(&self) -> TaskResult {
        let result = self.core.snapshot();
        match result.status {
            TaskStatus::Completed => info!(
                task_id = %result.task_id,
                task = %result.name,
                elapsed = ?result.execution_time,
                "task completed"
            ),
            status => debug!(task_id = %result.task_id, %status, "task finished"),
        }
        self.core.notify_complete(&result);
        result
    }

    /// Cancel the task.
    ///
    /// A pending task becomes `Cancelled` immediately. A running or paused
    /// task only gets its cancellation flag set; the job is expected to notice.
    pub fn cancel(&self) -> bool {
        let status = self.core.lock_state().status;
        match status {
            TaskStatus::Pending => match self.settle_pending(TaskStatus::Cancelled, TaskError::Cancelled) {
                Some(result) => {
                    info!(task_id = %self.core.id, task = %self.core.name, "task cancelled before start");
                    self.announce(&result);
                    true
                }
                // Started between the two locks; fall back to the flag.
                None => self.cancel(),
            },
            TaskStatus::Running | TaskStatus::Paused => {
                self.core.signals.cancel();
                info!(task_id = %self.core.id, task = %self.core.name, "cancellation requested");
                true
            }
            _ => false,
        }
    }

    pub fn pause(&self) -> bool {
        {
            let mut state = self.core.lock_state();
            if state.status != TaskStatus::Running {
                return false;
            }
            state.status = TaskStatus::Paused;
            self.core.signals.set_paused(true);
        }
        info!(task_id = %self.core.id, task = %self.core.name, "task paused");
        self.core.notify_status(TaskStatus::Paused);
        true
    }

    pub fn resume(&self) -> bool {
        {
            let mut state = self.core.lock_state();
            if state.status != TaskStatus::Paused {
                return false;
            }
            state.status = TaskStatus::Running;
            self.core.signals.set_paused(false);
        }
        info!(task_id = %self.core.id, task = %self.core.name, "task resumed");
        self.core.notify_status(TaskStatus::Running);
        true
    }

    /// Resolve a task that never started. Observers are not fired; call
    /// [`announce`](Self::announce) once every lock is released.
    pub(crate) fn settle_pending(&self, status: TaskStatus, reason: TaskError) -> Option<TaskResult> {
        let mut state = self.core.lock_state();
        if state.status != TaskStatus::Pending {
            return None;
        }
        if status == TaskStatus::Cancelled {
            self.core.signals.cancel();
        }
        state.finish(status, Some(reason.to_string()), None);
        Some(self.core.snapshot_locked(&state))
    }

    /// Force a started task into `Failed` after its run blew up outside the
    /// guard. Already-terminal tasks keep their status.
    pub(crate) fn abort(&self, reason: TaskError) -> TaskResult {
        if self.core.finish(TaskStatus::Failed, Some(reason.to_string()), None) {
            warn!(task_id = %self.core.id, task = %self.core.name, "task aborted");
        }
        self.core.snapshot()
    }

    /// Fire status and completion observers for a result settled elsewhere.
    pub(crate) fn announce(&self, result: &TaskResult) {
        self.core.notify_status(result.status);
        self.core.notify_complete(result);
    }
}

// ── Builder ──────────────────────────────────────────────────

/// Fluent builder for [`Task`].
///
/// # Example
/// ```ignore
/// let task = Task::builder("disk-scan")
///     .priority(Priority::High)
///     .timeout(Duration::from_secs(30))
///     .on_progress(|p| println!("{p:.0}%"))
///     .build_fn(|ctx| {
///         ctx.checkpoint()?;
///         Ok(Payload::new())
///     });
/// ```
pub struct TaskBuilder {
    name: String,
    description: String,
    config: TaskConfig,
    observers: Observers,
}

impl TaskBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            config: TaskConfig::default(),
            observers: Observers::default(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.config.priority = priority;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, count: u32) -> Self {
        self.config.retry_count = count;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.config.retry_backoff = Some(backoff);
        self
    }

    pub fn depends_on(mut self, id: TaskId) -> Self {
        if !self.config.dependencies.contains(&id) {
            self.config.dependencies.push(id);
        }
        self
    }

    pub fn on_progress(mut self, f: impl Fn(f64) + Send + Sync + 'static) -> Self {
        self.observers.on_progress = Some(Box::new(f));
        self
    }

    pub fn on_status_change(mut self, f: impl Fn(TaskStatus) + Send + Sync + 'static) -> Self {
        self.observers.on_status_change = Some(Box::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl Fn(&TaskResult) + Send + Sync + 'static) -> Self {
        self.observers.on_complete = Some(Box::new(f));
        self
    }

    pub fn build(self, job: impl Job) -> Task {
        let id = TaskId::new();
        debug!(task_id = %id, task = %self.name, "task created");
        Task {
            core: Arc::new(TaskCore {
                id,
                name: self.name,
                state: Mutex::new(TaskState::new()),
                signals: TaskSignals::default(),
                observers: self.observers,
            }),
            description: self.description,
            config: self.config,
            job: Arc::new(job),
        }
    }

    /// [`build`](Self::build) for closures, with the job signature spelled out.
    pub fn build_fn<F>(self, f: F) -> Task
    where
        F: Fn(&TaskContext) -> Result<Payload, JobError> + Send + Sync + 'static,
    {
        self.build(f)
    }
}
