//! Priority task scheduler with dependency gating, timeouts and cooperative
//! cancellation.
//!
//! Callers wrap a [`Job`] in a [`Task`], submit it to a [`Scheduler`] and read
//! back a [`TaskResult`]. The scheduler dispatches pending tasks from four
//! priority queues onto a bounded rayon worker pool; every task runs its job
//! under an execution guard that enforces the task's timeout.

pub mod config;
pub mod context;
pub mod error;
pub mod guard;
pub mod helpers;
pub mod metrics;
pub mod result;
pub mod runner;
pub mod task;
pub mod types;

pub use config::SchedulerConfig;
pub use context::TaskContext;
pub use error::{JobError, SchedulerError, TaskError};
pub use helpers::{chain_tasks, wait_for_task};
pub use metrics::{SchedulerStats, SchedulerStatus};
pub use result::{TaskEntry, TaskInfo, TaskResult};
pub use runner::Scheduler;
pub use task::{Job, Task, TaskBuilder, TaskConfig};
pub use types::{Payload, Priority, TaskId, TaskStatus};
