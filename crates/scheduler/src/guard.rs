//! Execution guard: runs a job on its own thread and supervises it for
//! completion, cancellation and timeout.
//!
//! The job thread is detached. When the guard gives up on it (cancel or
//! timeout) it trips the attempt's stop signal, so a job that checks its
//! [`TaskContext`] returns promptly. Jobs that never check it leak the thread
//! until they return on their own.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::context::TaskContext;
use crate::error::{panic_message, JobError};
use crate::task::Job;
use crate::types::Payload;

thread_local! {
    static ON_JOB_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Whether the caller is running on a job thread spawned by the guard.
/// Observers fired from a job run here too.
pub(crate) fn on_job_thread() -> bool {
    ON_JOB_THREAD.with(Cell::get)
}

/// Thread name for a task. Interior NULs are not allowed by the OS.
fn thread_name(task_name: &str) -> String {
    format!("job-{}", task_name.replace('\0', "?"))
}

/// What the supervisor observed.
#[derive(Debug)]
pub enum GuardOutcome {
    /// The job returned (successfully or not) before any deadline.
    Finished(Result<Payload, JobError>),
    /// Cancellation was requested while the job was still running.
    Cancelled,
    /// The deadline elapsed while the job was still running.
    TimedOut(Duration),
}

/// Run `job` under a `timeout`, re-checking cancellation every `poll`.
pub fn run_guarded(
    job: Arc<dyn Job>,
    ctx: TaskContext,
    timeout: Duration,
    poll: Duration,
) -> GuardOutcome {
    let (tx, rx) = mpsc::sync_channel::<Result<Payload, JobError>>(1);
    let job_ctx = ctx.clone();

    let spawned = thread::Builder::new()
        .name(thread_name(ctx.task_name()))
        .spawn(move || {
            ON_JOB_THREAD.with(|flag| flag.set(true));
            let result = panic::catch_unwind(AssertUnwindSafe(|| job.execute(&job_ctx)))
                .unwrap_or_else(|payload| Err(JobError::Panicked(panic_message(&*payload))));
            job_ctx.attempt().mark_exited();
            // The supervisor may have stopped listening; nothing to do then.
            let _ = tx.send(result);
        });

    if let Err(e) = spawned {
        ctx.attempt().mark_exited();
        return GuardOutcome::Finished(Err(JobError::Spawn(e)));
    }

    let deadline = Instant::now() + timeout;
    loop {
        if ctx.is_cancelled() {
            info!(task_id = %ctx.task_id(), task = %ctx.task_name(), "cancelled during execution");
            ctx.abandon();
            return GuardOutcome::Cancelled;
        }

        let now = Instant::now();
        if now >= deadline {
            debug!(task_id = %ctx.task_id(), ?timeout, "abandoning job thread after timeout");
            ctx.abandon();
            return GuardOutcome::TimedOut(timeout);
        }

        match rx.recv_timeout(poll.min(deadline - now)) {
            Ok(result) => return GuardOutcome::Finished(result),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                return GuardOutcome::Finished(Err(JobError::failed(
                    "job thread exited without reporting a result",
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    const POLL: Duration = Duration::from_millis(20);

    fn guard(task: &Task, timeout: Duration) -> GuardOutcome {
        run_guarded(task.job(), task.context(), timeout, POLL)
    }

    #[test]
    fn returns_job_payload() {
        let task = Task::builder("ok").build_fn(|_| {
            let mut out = Payload::new();
            out.insert("cpu".into(), 42.into());
            Ok(out)
        });
        match guard(&task, Duration::from_secs(1)) {
            GuardOutcome::Finished(Ok(data)) => assert_eq!(data["cpu"], 42),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn propagates_job_error() {
        let task = Task::builder("err").build_fn(|_| Err(JobError::failed("sensor offline")));
        match guard(&task, Duration::from_secs(1)) {
            GuardOutcome::Finished(Err(JobError::Failed(msg))) => assert_eq!(msg, "sensor offline"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn converts_panic_into_error() {
        let task = Task::builder("boom").build_fn(|_| panic!("sensor crashed"));
        match guard(&task, Duration::from_secs(1)) {
            GuardOutcome::Finished(Err(JobError::Panicked(msg))) => assert!(msg.contains("sensor crashed")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn times_out_without_waiting_for_job() {
        let task = Task::builder("hang").build_fn(|_| {
            thread::sleep(Duration::from_secs(3));
            Ok(Payload::new())
        });
        let start = Instant::now();
        let outcome = guard(&task, Duration::from_millis(200));
        let elapsed = start.elapsed();

        assert!(matches!(outcome, GuardOutcome::TimedOut(_)));
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(200) + POLL * 5, "took {elapsed:?}");
    }

    #[test]
    fn timeout_stops_cooperative_job() {
        let task = Task::builder("spin").build_fn(|ctx| loop {
            ctx.checkpoint()?;
            thread::sleep(Duration::from_millis(5));
        });
        let ctx = task.context();
        let outcome = run_guarded(task.job(), ctx.clone(), Duration::from_millis(100), POLL);

        assert!(matches!(outcome, GuardOutcome::TimedOut(_)));
        assert!(ctx.is_cancelled());
        assert!(!task.is_cancelled());
        assert!(ctx.attempt().wait_exited(Duration::from_secs(1)));
    }

    #[test]
    fn job_thread_is_marked() {
        assert!(!on_job_thread());
        let task = Task::builder("marker").build_fn(|_| {
            let mut out = Payload::new();
            out.insert("on_job_thread".into(), on_job_thread().into());
            Ok(out)
        });
        match guard(&task, Duration::from_secs(1)) {
            GuardOutcome::Finished(Ok(data)) => assert_eq!(data["on_job_thread"], true),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn task_name_with_nul_still_runs() {
        assert_eq!(thread_name("a\0b"), "job-a?b");
        let task = Task::builder("a\0b").build_fn(|_| Ok(Payload::new()));
        assert!(matches!(guard(&task, Duration::from_secs(1)), GuardOutcome::Finished(Ok(_))));
    }

    #[test]
    fn observes_cancellation() {
        let task = Task::builder("cancel-me").build_fn(|ctx| {
            while !ctx.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
            Err(JobError::Cancelled)
        });
        let start = Instant::now();
        let outcome = thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(60));
                task.cancel();
            });
            guard(&task, Duration::from_secs(5))
        });
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(matches!(
            outcome,
            GuardOutcome::Cancelled | GuardOutcome::Finished(Err(JobError::Cancelled))
        ));
    }
}
