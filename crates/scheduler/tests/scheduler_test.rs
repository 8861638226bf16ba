//! End-to-end scheduling scenarios against the public API.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use hostwatch_scheduler::*;

const WAIT: Option<Duration> = Some(Duration::from_secs(10));

fn fast_config(workers: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_workers: workers,
        dispatch_interval_ms: 10,
        guard_poll_interval_ms: 10,
        wait_poll_interval_ms: 10,
        ..SchedulerConfig::default()
    }
}

fn noop(name: &str) -> Task {
    Task::builder(name).build_fn(|_| Ok(Payload::new()))
}

// ── Ordering ─────────────────────────────────────────────────────────

#[test]
fn single_worker_runs_highest_priority_first() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let scheduler = Scheduler::new(fast_config(1));

    let mut ids = Vec::new();
    for (name, priority) in [("A", Priority::Low), ("B", Priority::Critical), ("C", Priority::Normal)] {
        let order = Arc::clone(&order);
        let task = Task::builder(name)
            .priority(priority)
            .build_fn(move |ctx| {
                order.lock().unwrap().push(ctx.task_name().to_string());
                Ok(Payload::new())
            });
        ids.push(scheduler.add_task(task).unwrap());
    }

    scheduler.start().unwrap();
    for id in &ids {
        assert!(wait_for_task(&scheduler, id, WAIT).unwrap().is_success());
    }
    scheduler.stop(true);

    assert_eq!(*order.lock().unwrap(), vec!["B", "C", "A"]);
}

#[test]
fn concurrency_never_exceeds_pool_size() {
    let scheduler = Scheduler::new(fast_config(3));
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    scheduler.start().unwrap();

    let mut ids = Vec::new();
    for i in 0..12 {
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        let task = Task::builder(format!("sample-{i}")).build_fn(move |_| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(30));
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(Payload::new())
        });
        ids.push(scheduler.add_task(task).unwrap());
    }

    for id in &ids {
        wait_for_task(&scheduler, id, WAIT).unwrap();
    }
    scheduler.stop(true);

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(scheduler.get_status().stats.completed, 12);
}

// ── Dependencies ─────────────────────────────────────────────────────

#[test]
fn chained_tasks_run_in_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let scheduler = Scheduler::new(fast_config(4));
    scheduler.start().unwrap();

    let tasks = ["collect", "aggregate", "publish"]
        .into_iter()
        .map(|name| {
            let order = Arc::clone(&order);
            Task::builder(name)
                .priority(Priority::Critical)
                .build_fn(move |ctx| {
                    thread::sleep(Duration::from_millis(10));
                    order.lock().unwrap().push(ctx.task_name().to_string());
                    Ok(Payload::new())
                })
        })
        .collect();
    let ids = chain_tasks(&scheduler, tasks).unwrap();

    assert_eq!(ids.len(), 3);
    assert_eq!(scheduler.get_task(&ids[2]).map(|t| t.dependencies().to_vec()), Some(vec![ids[1]]));

    let last = wait_for_task(&scheduler, &ids[2], WAIT).unwrap();
    assert!(last.is_success());
    assert_eq!(*order.lock().unwrap(), vec!["collect", "aggregate", "publish"]);
}

#[test]
fn dependency_on_finished_task_is_accepted() {
    let scheduler = Scheduler::new(fast_config(2));
    scheduler.start().unwrap();

    let first = scheduler.add_task(noop("first")).unwrap();
    wait_for_task(&scheduler, &first, WAIT).unwrap();

    let second = scheduler
        .add_task(Task::builder("second").depends_on(first).build_fn(|_| Ok(Payload::new())))
        .unwrap();
    assert!(wait_for_task(&scheduler, &second, WAIT).unwrap().is_success());
}

#[test]
fn timed_out_dependency_fails_dependent() {
    let scheduler = Scheduler::new(fast_config(2));
    scheduler.start().unwrap();

    let slow = scheduler
        .add_task(
            Task::builder("slow")
                .timeout(Duration::from_millis(100))
                .build_fn(|ctx| {
                    ctx.sleep(Duration::from_secs(5))?;
                    Ok(Payload::new())
                }),
        )
        .unwrap();
    let after = scheduler
        .add_task(Task::builder("after").depends_on(slow).build_fn(|_| Ok(Payload::new())))
        .unwrap();

    let result = wait_for_task(&scheduler, &after, WAIT).unwrap();
    assert_eq!(result.status, TaskStatus::Failed);
    assert!(result.error.unwrap().contains("timeout"));
    assert_eq!(scheduler.get_task_result(&slow).unwrap().status, TaskStatus::Timeout);
}

#[test]
fn unknown_dependency_is_rejected() {
    let scheduler = Scheduler::new(fast_config(1));
    let err = scheduler
        .add_task(Task::builder("orphan").depends_on(TaskId::new()).build_fn(|_| Ok(Payload::new())))
        .unwrap_err();

    assert!(matches!(err, SchedulerError::UnknownDependency { .. }));
    assert!(scheduler.get_all_tasks().is_empty());
}

// ── Timeouts, retries, cancellation ──────────────────────────────────

#[test]
fn timeout_ends_task_without_waiting_for_job() {
    let scheduler = Scheduler::new(fast_config(1));
    scheduler.start().unwrap();

    let started = Instant::now();
    let id = scheduler
        .add_task(
            Task::builder("stuck-sensor")
                .timeout(Duration::from_secs(1))
                .build_fn(|_| {
                    thread::sleep(Duration::from_secs(5));
                    Ok(Payload::new())
                }),
        )
        .unwrap();

    let result = wait_for_task(&scheduler, &id, WAIT).unwrap();
    let elapsed = started.elapsed();
    assert_eq!(result.status, TaskStatus::Timeout);
    assert!(result.error.unwrap().contains("timeout"));
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");
    assert_eq!(scheduler.get_status().stats.timed_out, 1);
}

#[test]
fn retries_until_success() {
    let scheduler = Scheduler::new(fast_config(1));
    scheduler.start().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    let id = scheduler
        .add_task(
            Task::builder("flaky")
                .retries(3)
                .retry_backoff(Duration::from_millis(10))
                .build_fn(move |_| {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(JobError::failed("read error"))
                    } else {
                        Ok(Payload::new())
                    }
                }),
        )
        .unwrap();

    let result = wait_for_task(&scheduler, &id, WAIT).unwrap();
    assert!(result.is_success());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.metadata["attempts"], 3);
    assert_eq!(scheduler.get_status().stats.retries, 2);
}

#[test]
fn cancelled_pending_task_is_never_dispatched() {
    let scheduler = Scheduler::new(fast_config(1));
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);
    let id = scheduler
        .add_task(Task::builder("skip-me").build_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Payload::new())
        }))
        .unwrap();

    assert!(scheduler.cancel_task(&id));
    scheduler.start().unwrap();
    let marker = scheduler.add_task(noop("marker")).unwrap();
    wait_for_task(&scheduler, &marker, WAIT).unwrap();
    scheduler.stop(true);

    assert_eq!(ran.load(Ordering::SeqCst), 0);
    let result = scheduler.get_task_result(&id).unwrap();
    assert_eq!(result.status, TaskStatus::Cancelled);
    assert!(result.start_time.is_none());
}

// ── Observers ────────────────────────────────────────────────────────

#[test]
fn observers_see_progress_and_status() {
    let scheduler = Scheduler::new(fast_config(1));
    scheduler.start().unwrap();
    let progress = Arc::new(Mutex::new(Vec::new()));
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicUsize::new(0));

    let (p, s, d) = (Arc::clone(&progress), Arc::clone(&statuses), Arc::clone(&done));
    let task = Task::builder("reporting")
        .on_progress(move |v| p.lock().unwrap().push(v))
        .on_status_change(move |st| s.lock().unwrap().push(st))
        .on_complete(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        })
        .build_fn(|ctx| {
            ctx.update_progress(50.0, Some("halfway"));
            ctx.update_progress(250.0, None);
            Ok(Payload::new())
        });
    let id = scheduler.add_task(task).unwrap();

    let result = wait_for_task(&scheduler, &id, WAIT).unwrap();
    assert_eq!(result.progress, 100.0);
    assert_eq!(result.metadata["progress_message"], "halfway");
    assert_eq!(*progress.lock().unwrap(), vec![50.0, 100.0]);
    assert_eq!(*statuses.lock().unwrap(), vec![TaskStatus::Running, TaskStatus::Completed]);
    assert_eq!(done.load(Ordering::SeqCst), 1);
}

// ── Waiting ──────────────────────────────────────────────────────────

#[test]
fn wait_for_task_returns_none_on_timeout_or_unknown_id() {
    let scheduler = Scheduler::new(fast_config(1));
    let id = scheduler.add_task(noop("never-started")).unwrap();

    let started = Instant::now();
    assert!(wait_for_task(&scheduler, &id, Some(Duration::from_millis(100))).is_none());
    assert!(started.elapsed() >= Duration::from_millis(100));

    assert!(wait_for_task(&scheduler, &TaskId::new(), None).is_none());
}

// ── Config ───────────────────────────────────────────────────────────

#[test]
fn scheduler_from_toml_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "max_workers = 2\ncompleted_capacity = 5\ndispatch_interval_ms = 20").unwrap();

    let config = SchedulerConfig::from_file(file.path(), "").unwrap();
    let scheduler = Scheduler::new(config);
    assert_eq!(scheduler.max_workers(), 2);

    scheduler.start().unwrap();
    let status = scheduler.get_status();
    assert!(status.is_running);
    assert_eq!(status.max_workers, 2);
    assert_eq!(status.queue_sizes.len(), 4);

    let json = status.to_json();
    assert_eq!(json["queue_sizes"]["LOW"], 0);
    scheduler.stop(false);
}
