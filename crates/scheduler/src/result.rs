use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Payload, Priority, TaskId, TaskStatus};

/// Immutable snapshot of a task, taken when it reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    /// Payload returned by the job (empty unless completed).
    pub data: Payload,
    pub error: Option<String>,
    /// Wall time between start and end, in seconds when serialized.
    #[serde(with = "duration_secs")]
    pub execution_time: Duration,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub progress: f64,
    pub metadata: Payload,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Live view of a task that has not finished yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub name: String,
    pub description: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub progress: f64,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub retry_count: u32,
    pub dependencies: Vec<TaskId>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(with = "duration_secs")]
    pub execution_time: Duration,
    pub error: Option<String>,
    pub metadata: Payload,
}

/// One row of [`Scheduler::get_all_tasks`](crate::Scheduler::get_all_tasks).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskEntry {
    Active(TaskInfo),
    Finished(TaskResult),
}

impl TaskEntry {
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskEntry::Active(info) => info.status,
            TaskEntry::Finished(result) => result.status,
        }
    }
}

/// Serialize a `Duration` as fractional seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(status: TaskStatus) -> TaskResult {
        TaskResult {
            task_id: TaskId::new(),
            name: "disk-usage".into(),
            status,
            data: Payload::new(),
            error: None,
            execution_time: Duration::from_millis(1500),
            start_time: Some(Utc::now()),
            end_time: Some(Utc::now()),
            progress: 100.0,
            metadata: Payload::new(),
        }
    }

    #[test]
    fn json_shape_is_flat() {
        let json = sample(TaskStatus::Completed).to_json();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["execution_time"], 1.5);
        assert_eq!(json["name"], "disk-usage");
        assert!(json["error"].is_null());
    }

    #[test]
    fn entry_is_tagged() {
        let entry = TaskEntry::Finished(sample(TaskStatus::Timeout));
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["kind"], "finished");
        assert_eq!(entry.status(), TaskStatus::Timeout);
    }

    #[test]
    fn success_only_when_completed() {
        assert!(sample(TaskStatus::Completed).is_success());
        assert!(!sample(TaskStatus::Failed).is_success());
    }
}
