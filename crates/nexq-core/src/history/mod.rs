//! Durable audit store port.
//!
//! The queue engine and worker treat history as optional: when no store is
//! configured every write is skipped, and when a configured store fails the
//! caller logs and continues. History failures never block task progress.

mod memory;
mod models;
mod postgres;

pub use memory::MemoryHistory;
pub use models::{
    AttemptRecord, FailureAnalysisRow, HourlyBreakdownRow, RetryAnalysisRow, TaskStats,
    TaskSummary, TaskSummaryRow, WorkerPerformanceRow,
};
pub use postgres::PostgresHistory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{Task, TaskStatus};
use crate::error::Error;

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Upsert keyed by task id; on conflict updates status, retry_count,
    /// failure_reason and scheduled_at.
    async fn save_task(&self, task: &Task) -> Result<(), Error>;

    /// Full task snapshot including derived timing columns.
    async fn get_task(&self, task_id: &str) -> Result<Task, Error>;

    /// Sets status; `started_at` is stamped exactly when the status becomes
    /// `running` (idempotent if it already is).
    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        worker_id: &str,
    ) -> Result<(), Error>;

    async fn complete_task(&self, task_id: &str, duration_ms: i64) -> Result<(), Error>;

    async fn fail_task(&self, task_id: &str, reason: &str, duration_ms: i64) -> Result<(), Error>;

    async fn move_task_to_dlq(&self, task_id: &str, reason: &str) -> Result<(), Error>;

    async fn increment_retry_count(&self, task_id: &str) -> Result<(), Error>;

    /// Append-only; one row per handler invocation.
    #[allow(clippy::too_many_arguments)]
    async fn log_execution(
        &self,
        task_id: &str,
        attempt_number: u32,
        status: TaskStatus,
        duration_ms: i64,
        error_message: &str,
        worker_id: &str,
    ) -> Result<(), Error>;

    /// Per (type, status) counts with duration and retry aggregates over the
    /// last `hours`.
    async fn task_stats(&self, hours: i64) -> Result<Vec<TaskStats>, Error>;

    async fn recent_tasks(&self, limit: i64) -> Result<Vec<TaskSummary>, Error>;

    async fn tasks_by_type(&self, task_type: &str, limit: i64) -> Result<Vec<TaskSummary>, Error>;

    /// Attempt log for one task, ascending by start time.
    async fn task_history(&self, task_id: &str) -> Result<Vec<AttemptRecord>, Error>;

    async fn report_task_summary(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TaskSummaryRow>, Error>;

    async fn report_worker_performance(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<WorkerPerformanceRow>, Error>;

    async fn report_failure_analysis(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<FailureAnalysisRow>, Error>;

    async fn report_hourly_breakdown(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HourlyBreakdownRow>, Error>;

    async fn report_retry_analysis(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RetryAnalysisRow>, Error>;
}
