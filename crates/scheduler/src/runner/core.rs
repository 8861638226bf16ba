use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::metrics::{SchedulerStats, SchedulerStatus};
use crate::result::{TaskEntry, TaskResult};
use crate::task::Task;
use crate::types::{Priority, TaskId};

use super::lifecycle::Runtime;

/// Position of a task in one of the priority queues.
#[derive(Debug, Clone, Copy)]
pub(super) struct QueueEntry {
    /// Submission order, unique across all queues.
    pub(super) seq: u64,
    pub(super) enqueued_at: Instant,
    pub(super) id: TaskId,
}

/// A task that has been handed to the worker pool.
pub(super) struct RunningHandle {
    pub(super) task: Arc<Task>,
    pub(super) dispatched_at: Instant,
}

/// Everything guarded by the scheduler lock.
///
/// `tasks` holds submitted tasks that have no recorded result yet.
/// `completed` holds recorded results. An id is never in both.
pub(crate) struct SchedulerState {
    pub(super) tasks: HashMap<TaskId, Arc<Task>>,
    /// FIFO per priority, indexed by [`Priority::index`].
    pub(super) queues: [VecDeque<QueueEntry>; 4],
    pub(super) running: HashMap<TaskId, RunningHandle>,
    pub(crate) completed: HashMap<TaskId, TaskResult>,
    /// `completed` ordered by end time, oldest first.
    completed_order: BTreeSet<(Option<DateTime<Utc>>, TaskId)>,
    pub(super) stats: SchedulerStats,
    next_seq: u64,
    /// Set when something happened that the dispatcher should look at.
    pub(super) wake_pending: bool,
}

impl SchedulerState {
    fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            queues: Default::default(),
            running: HashMap::new(),
            completed: HashMap::new(),
            completed_order: BTreeSet::new(),
            stats: SchedulerStats::default(),
            next_seq: 0,
            wake_pending: false,
        }
    }

    pub(super) fn enqueue(&mut self, id: TaskId, priority: Priority) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queues[priority.index()].push_back(QueueEntry {
            seq,
            enqueued_at: Instant::now(),
            id,
        });
    }

    /// Drop `id` from whichever queue holds it. Returns whether it was queued.
    pub(super) fn dequeue(&mut self, id: &TaskId) -> bool {
        for queue in self.queues.iter_mut() {
            if let Some(pos) = queue.iter().position(|e| e.id == *id) {
                queue.remove(pos);
                return true;
            }
        }
        false
    }

    /// Whether `id` is submitted and not yet recorded.
    pub(crate) fn is_live(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    pub(super) fn pending_count(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    /// Move a terminal result out of the live set and into `completed`.
    pub(super) fn record_result(&mut self, result: TaskResult, capacity: usize) {
        let id = result.task_id;
        self.tasks.remove(&id);
        self.stats.record(&result);
        let end_time = result.end_time;
        if let Some(previous) = self.completed.insert(id, result) {
            self.completed_order.remove(&(previous.end_time, id));
        }
        self.completed_order.insert((end_time, id));
        self.running.remove(&id);
        self.evict_completed(capacity);
    }

    /// Drop the oldest results (by end time) until `capacity` is respected.
    fn evict_completed(&mut self, capacity: usize) {
        while self.completed.len() > capacity {
            let Some((_, id)) = self.completed_order.pop_first() else {
                break;
            };
            self.completed.remove(&id);
            debug!(task_id = %id, "evicted completed result");
        }
    }

    /// Finished results, newest end time first.
    pub(super) fn finished_newest_first(&self) -> impl Iterator<Item = &TaskResult> {
        self.completed_order
            .iter()
            .rev()
            .filter_map(|(_, id)| self.completed.get(id))
    }
}

/// State shared between the public handle, the dispatcher and the workers.
pub(crate) struct Shared {
    pub(crate) config: SchedulerConfig,
    pub(super) max_workers: usize,
    pub(super) state: Mutex<SchedulerState>,
    /// Dispatcher wake-up.
    pub(super) wake: Condvar,
    /// Signalled whenever `completed` or `running` changes.
    pub(crate) finished: Condvar,
}

impl Shared {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn wake_dispatcher(&self) {
        self.lock_state().wake_pending = true;
        self.wake.notify_one();
    }
}

/// Priority task scheduler.
///
/// Owns four FIFO queues (one per [`Priority`]), a dispatcher thread that
/// moves ready tasks onto a bounded rayon pool, and the table of finished
/// results. Construct it once at the composition root and share it by
/// reference; dropping it stops the dispatcher and cancels running tasks.
pub struct Scheduler {
    pub(crate) shared: Arc<Shared>,
    pub(super) runtime: Mutex<Option<Runtime>>,
}

impl Scheduler {
    /// Create a stopped scheduler. Call [`start`](Self::start) to begin dispatching.
    pub fn new(config: SchedulerConfig) -> Self {
        let max_workers = config.resolved_max_workers();
        info!(max_workers, "scheduler created");
        Self {
            shared: Arc::new(Shared {
                config,
                max_workers,
                state: Mutex::new(SchedulerState::new()),
                wake: Condvar::new(),
                finished: Condvar::new(),
            }),
            runtime: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    pub fn max_workers(&self) -> usize {
        self.shared.max_workers
    }

    /// Submit a task. Tasks may be submitted before [`start`](Self::start);
    /// they wait in their queue until the dispatcher runs.
    ///
    /// Every dependency must refer to a task this scheduler currently tracks,
    /// either live or among the retained results.
    pub fn add_task(&self, mut task: Task) -> Result<TaskId, SchedulerError> {
        let id = task.id();
        if task.dependencies().contains(&id) {
            return Err(SchedulerError::SelfDependency(id));
        }

        {
            let defaults = &self.shared.config;
            let config = task.config_mut();
            config.timeout.get_or_insert(defaults.default_timeout());
            config.retry_backoff.get_or_insert(defaults.retry_backoff());
            config.poll_interval = defaults.guard_poll_interval();
        }

        let priority = task.priority();
        {
            let mut state = self.shared.lock_state();
            if state.tasks.contains_key(&id) || state.completed.contains_key(&id) {
                return Err(SchedulerError::DuplicateTask(id));
            }
            if let Some(missing) = task
                .dependencies()
                .iter()
                .find(|dep| !state.tasks.contains_key(*dep) && !state.completed.contains_key(*dep))
            {
                return Err(SchedulerError::UnknownDependency {
                    task: id,
                    dependency: *missing,
                });
            }

            info!(
                task_id = %id,
                task = %task.name(),
                %priority,
                dependencies = task.dependencies().len(),
                "task submitted"
            );
            state.tasks.insert(id, Arc::new(task));
            state.enqueue(id, priority);
            state.stats.submitted += 1;
            state.wake_pending = true;
        }
        self.shared.wake.notify_one();
        Ok(id)
    }

    /// Live handle of a task that has not been recorded yet.
    pub fn get_task(&self, id: &TaskId) -> Option<Arc<Task>> {
        self.shared.lock_state().tasks.get(id).cloned()
    }

    /// Retained result of a finished task.
    pub fn get_task_result(&self, id: &TaskId) -> Option<TaskResult> {
        self.shared.lock_state().completed.get(id).cloned()
    }

    pub fn get_status(&self) -> SchedulerStatus {
        let is_running = self.is_running();
        let state = self.shared.lock_state();
        let queue_sizes: BTreeMap<Priority, usize> = Priority::DESCENDING
            .iter()
            .map(|p| (*p, state.queues[p.index()].len()))
            .collect();

        SchedulerStatus {
            is_running,
            max_workers: self.shared.max_workers,
            pending_tasks: state.pending_count(),
            running_tasks: state.running.len(),
            completed_tasks: state.completed.len(),
            queue_sizes,
            stats: state.stats.clone(),
        }
    }

    /// Every live task plus the most recently finished ones, keyed by id.
    ///
    /// At most `listing_limit` finished results are included, newest first
    /// by end time.
    pub fn get_all_tasks(&self) -> BTreeMap<TaskId, TaskEntry> {
        let state = self.shared.lock_state();
        let mut entries: BTreeMap<TaskId, TaskEntry> = state
            .tasks
            .iter()
            .map(|(id, task)| (*id, TaskEntry::Active(task.info())))
            .collect();

        for result in state
            .finished_newest_first()
            .take(self.shared.config.listing_limit)
        {
            entries.insert(result.task_id, TaskEntry::Finished(result.clone()));
        }
        entries
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop(false);
    }
}
