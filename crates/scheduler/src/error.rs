use std::time::Duration;

use thiserror::Error;

use crate::types::{TaskId, TaskStatus};

/// Errors returned by the public [`Scheduler`](crate::Scheduler) API.
///
/// These are programmer/configuration errors. Failures of the work itself
/// never surface here; they end up on the task's [`TaskResult`](crate::TaskResult).
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("task {0} lists itself as a dependency")]
    SelfDependency(TaskId),

    #[error("task {0} is already tracked by this scheduler")]
    DuplicateTask(TaskId),

    #[error("failed to build worker pool: {0}")]
    WorkerPool(String),

    #[error("failed to spawn dispatcher thread: {0}")]
    Dispatcher(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),
}

/// Error returned by a [`Job`](crate::Job) implementation.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    Failed(String),

    /// The job observed its cancellation signal and stopped early.
    #[error("cancelled")]
    Cancelled,

    #[error("job panicked: {0}")]
    Panicked(String),

    #[error("failed to spawn job thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl JobError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Why a task ended in a non-successful terminal state.
///
/// Rendered into [`TaskResult::error`](crate::TaskResult) via `Display`.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("execution exceeded timeout of {0:?}")]
    Timeout(Duration),

    #[error("task {task} failed: {message}")]
    Execution { task: String, message: String },

    #[error("task cancelled")]
    Cancelled,

    #[error("dependency {dependency} ended as {status}")]
    DependencyFailed { dependency: TaskId, status: TaskStatus },

    #[error("dependency {0} is no longer tracked")]
    DependencyMissing(TaskId),

    #[error("worker panicked while running task: {0}")]
    WorkerPanic(String),
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
