use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{TaskPriority, TaskStatus};
use crate::error::Error;

/// Schemaless task payload: a JSON object handed through to the handler.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// One unit of work.
///
/// The JSON field names are the wire contract shared by the cache, the REST
/// API and the history store; optional fields are omitted when unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,

    #[serde(rename = "type")]
    pub task_type: String,

    pub payload: Payload,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,

    /// The task is invisible to dequeue while `now < scheduled_at`.
    pub scheduled_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Last error message from a failed attempt.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,

    /// Terminal reason recorded when the task is failed or dead-lettered.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub failure_reason: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moved_to_dlq_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(task_type: impl Into<String>, payload: Payload, priority: TaskPriority) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            payload,
            priority,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: 3,
            created_at: now,
            scheduled_at: now,
            started_at: None,
            completed_at: None,
            error: String::new(),
            failure_reason: String::new(),
            moved_to_dlq_at: None,
        }
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(data: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(data)?)
    }

    /// A failed task that has exhausted its retries must move to the DLQ.
    pub fn should_dead_letter(&self) -> bool {
        self.status == TaskStatus::Failed && self.retry_count >= self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn payload(pairs: &[(&str, serde_json::Value)]) -> Payload {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn new_task_defaults() {
        let task = Task::new("send_email", Payload::new(), TaskPriority::Medium);

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.created_at, task.scheduled_at);
        assert!(task.started_at.is_none());
        assert!(!task.id.is_empty());
    }

    #[test]
    fn fresh_ids_are_unique() {
        let a = Task::new("t", Payload::new(), TaskPriority::Low);
        let b = Task::new("t", Payload::new(), TaskPriority::Low);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn json_round_trip_is_lossless() {
        let mut task = Task::new(
            "generate_report",
            payload(&[("report_type", serde_json::json!("task_summary"))]),
            TaskPriority::High,
        );
        task.retry_count = 2;
        task.started_at = Some(task.created_at + Duration::seconds(1));
        task.completed_at = Some(task.created_at + Duration::seconds(5));
        task.error = "boom".to_string();
        task.failure_reason = "boom".to_string();
        task.moved_to_dlq_at = Some(task.created_at + Duration::seconds(6));

        let json = task.to_json().unwrap();
        let parsed = Task::from_json(&json).unwrap();

        assert_eq!(parsed.id, task.id);
        assert_eq!(parsed.task_type, task.task_type);
        assert_eq!(parsed.payload, task.payload);
        assert_eq!(parsed.priority, task.priority);
        assert_eq!(parsed.status, task.status);
        assert_eq!(parsed.retry_count, task.retry_count);
        assert_eq!(parsed.max_retries, task.max_retries);
        assert_eq!(parsed.created_at, task.created_at);
        assert_eq!(parsed.scheduled_at, task.scheduled_at);
        assert_eq!(parsed.started_at, task.started_at);
        assert_eq!(parsed.completed_at, task.completed_at);
        assert_eq!(parsed.error, task.error);
        assert_eq!(parsed.failure_reason, task.failure_reason);
        assert_eq!(parsed.moved_to_dlq_at, task.moved_to_dlq_at);
    }

    #[test]
    fn optional_fields_are_omitted_when_unset() {
        let task = Task::new("t", Payload::new(), TaskPriority::Low);
        let json = task.to_json().unwrap();

        assert!(!json.contains("started_at"));
        assert!(!json.contains("completed_at"));
        assert!(!json.contains("\"error\""));
        assert!(!json.contains("failure_reason"));
        assert!(!json.contains("moved_to_dlq_at"));
    }

    #[test]
    fn wire_field_names() {
        let task = Task::new("t", Payload::new(), TaskPriority::High);
        let value: serde_json::Value = serde_json::from_str(&task.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "t");
        assert_eq!(value["priority"], 2);
        assert_eq!(value["status"], "pending");
        assert_eq!(value["retry_count"], 0);
    }

    #[test]
    fn dead_letter_predicate() {
        let mut task = Task::new("t", Payload::new(), TaskPriority::Medium);
        assert!(!task.should_dead_letter());

        task.retry_count = 3;
        assert!(!task.should_dead_letter(), "pending tasks never dead-letter");

        task.status = TaskStatus::Failed;
        assert!(task.should_dead_letter());

        task.retry_count = 2;
        assert!(!task.should_dead_letter());
    }
}
