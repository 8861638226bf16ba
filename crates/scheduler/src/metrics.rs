use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::result::TaskResult;
use crate::types::{Priority, TaskStatus};

/// Lifetime counters kept by the scheduler.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    /// Tasks accepted by `add_task`.
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    /// Tasks dropped through `remove_task`.
    pub removed: u64,
    /// Extra attempts made by retrying tasks.
    pub retries: u64,
    /// Started tasks folded into the average.
    pub recorded: u64,
    /// Mean execution time over every recorded result.
    #[serde(serialize_with = "as_secs")]
    pub avg_execution_time: Duration,
}

impl SchedulerStats {
    /// Count a terminal result and fold its duration into the running mean.
    pub fn record(&mut self, result: &TaskResult) {
        match result.status {
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Timeout => self.timed_out += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
            TaskStatus::Pending | TaskStatus::Running | TaskStatus::Paused => return,
        }
        if let Some(attempts) = result.metadata.get("attempts").and_then(|v| v.as_u64()) {
            self.retries += attempts.saturating_sub(1);
        }
        // Tasks settled before starting have no execution time to average.
        if result.start_time.is_none() {
            return;
        }

        self.recorded += 1;
        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        self.avg_execution_time = if self.recorded == 1 {
            result.execution_time
        } else {
            let prev = self.avg_execution_time.as_secs_f64();
            let cur = result.execution_time.as_secs_f64();
            Duration::from_secs_f64((prev + (cur - prev) / self.recorded as f64).max(0.0))
        };
    }
}

fn as_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Point-in-time scheduler report for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub is_running: bool,
    pub max_workers: usize,
    /// Tasks waiting in any priority queue.
    pub pending_tasks: usize,
    pub running_tasks: usize,
    /// Results currently retained.
    pub completed_tasks: usize,
    pub queue_sizes: BTreeMap<Priority, usize>,
    pub stats: SchedulerStats,
}

impl SchedulerStatus {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Payload, TaskId};

    fn result(status: TaskStatus, millis: u64) -> TaskResult {
        TaskResult {
            task_id: TaskId::new(),
            name: "t".into(),
            status,
            data: Payload::new(),
            error: None,
            execution_time: Duration::from_millis(millis),
            start_time: Some(chrono::Utc::now()),
            end_time: None,
            progress: 0.0,
            metadata: Payload::new(),
        }
    }

    #[test]
    fn record_single_execution() {
        let mut stats = SchedulerStats::default();
        stats.record(&result(TaskStatus::Completed, 100));

        assert_eq!(stats.completed, 1);
        assert_eq!(stats.recorded, 1);
        assert_eq!(stats.avg_execution_time, Duration::from_millis(100));
    }

    #[test]
    fn record_multiple_executions_averages() {
        let mut stats = SchedulerStats::default();
        stats.record(&result(TaskStatus::Completed, 100));
        stats.record(&result(TaskStatus::Failed, 200));
        stats.record(&result(TaskStatus::Timeout, 300));

        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.timed_out, 1);
        let avg = stats.avg_execution_time.as_millis();
        assert!((195..=205).contains(&avg), "expected ~200ms, got {}ms", avg);
    }

    #[test]
    fn unstarted_results_counted_but_not_averaged() {
        let mut stats = SchedulerStats::default();
        let mut cancelled = result(TaskStatus::Cancelled, 0);
        cancelled.start_time = None;
        stats.record(&cancelled);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.recorded, 0);
    }

    #[test]
    fn retries_come_from_attempts_metadata() {
        let mut stats = SchedulerStats::default();
        let mut flaky = result(TaskStatus::Completed, 10);
        flaky.metadata.insert("attempts".into(), 3.into());
        stats.record(&flaky);
        stats.record(&result(TaskStatus::Completed, 10));
        assert_eq!(stats.retries, 2);
    }

    #[test]
    fn non_terminal_results_ignored() {
        let mut stats = SchedulerStats::default();
        stats.record(&result(TaskStatus::Running, 100));
        assert_eq!(stats.recorded, 0);
        assert_eq!(stats.avg_execution_time, Duration::ZERO);
    }

    #[test]
    fn status_json_uses_priority_names() {
        let mut queue_sizes = BTreeMap::new();
        queue_sizes.insert(Priority::Critical, 2);
        let status = SchedulerStatus {
            is_running: true,
            max_workers: 4,
            pending_tasks: 2,
            running_tasks: 0,
            completed_tasks: 0,
            queue_sizes,
            stats: SchedulerStats::default(),
        };
        let json = status.to_json();
        assert_eq!(json["queue_sizes"]["CRITICAL"], 2);
        assert_eq!(json["stats"]["avg_execution_time"], 0.0);
    }
}
