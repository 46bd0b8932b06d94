//! Rows returned by the history store's aggregate and report queries.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::TaskStatus;

/// Per (type, status) aggregate over a trailing window.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStats {
    #[serde(rename = "type")]
    pub task_type: String,
    pub status: TaskStatus,
    pub count: i64,
    pub avg_duration_ms: f64,
    pub max_duration_ms: i64,
    pub min_duration_ms: i64,
    pub avg_retries: f64,
}

/// One task as listed by `recent_tasks` / `tasks_by_type`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub task_id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub retry_count: i64,
    pub failure_reason: String,
}

/// One row of the append-only execution log.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub attempt_number: i64,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub worker_id: String,
}

#[derive(Debug, Clone)]
pub struct TaskSummaryRow {
    pub task_type: String,
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub dead_lettered: i64,
    pub avg_retries: f64,
    pub avg_duration_ms: f64,
    pub max_duration_ms: i64,
    pub min_duration_ms: i64,
    pub success_rate: f64,
}

#[derive(Debug, Clone)]
pub struct WorkerPerformanceRow {
    pub worker_id: String,
    pub tasks_processed: i64,
    pub completed: i64,
    pub failed: i64,
    pub avg_duration_ms: f64,
    pub max_duration_ms: i64,
    pub success_rate: f64,
}

#[derive(Debug, Clone)]
pub struct FailureAnalysisRow {
    pub task_type: String,
    pub error: String,
    pub occurrences: i64,
    pub last_occurrence: DateTime<Utc>,
    pub avg_retry_count: f64,
}

#[derive(Debug, Clone)]
pub struct HourlyBreakdownRow {
    pub hour: DateTime<Utc>,
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub avg_duration_ms: f64,
}

#[derive(Debug, Clone)]
pub struct RetryAnalysisRow {
    pub task_type: String,
    pub retry_count: i64,
    pub total: i64,
    pub eventually_succeeded: i64,
    pub failed: i64,
    pub dead_lettered: i64,
}
