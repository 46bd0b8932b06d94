//! In-memory history store.
//!
//! Records every call so tests can assert on interactions, and implements the
//! aggregate queries over its own state so the report handler and the history
//! endpoints can be exercised without Postgres. `fail_next_writes` simulates a
//! lost connection: every method errors until it is cleared.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use tokio::sync::Mutex;

use super::models::{
    AttemptRecord, FailureAnalysisRow, HourlyBreakdownRow, RetryAnalysisRow, TaskStats,
    TaskSummary, TaskSummaryRow, WorkerPerformanceRow,
};
use super::HistoryStore;
use crate::domain::{Task, TaskStatus};
use crate::error::Error;

#[derive(Debug, Clone)]
struct HistoryRow {
    task: Task,
    duration_ms: Option<i64>,
    worker_id: String,
}

#[derive(Debug, Clone)]
struct ExecutionRow {
    task_id: String,
    attempt_number: u32,
    status: TaskStatus,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
    duration_ms: Option<i64>,
    error_message: Option<String>,
    worker_id: String,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, HistoryRow>,
    executions: Vec<ExecutionRow>,
    save_task_calls: usize,
    update_status_calls: usize,
    complete_calls: Vec<(String, i64)>,
    fail_calls: Vec<(String, String, i64)>,
    dlq_calls: Vec<(String, String)>,
    increment_retry_calls: Vec<String>,
    failing: bool,
}

impl Inner {
    fn guard(&self) -> Result<(), Error> {
        if self.failing {
            return Err(Error::History(sqlx::Error::PoolClosed));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryHistory {
    inner: Mutex<Inner>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail, as if the connection dropped.
    pub async fn fail_next_writes(&self, failing: bool) {
        self.inner.lock().await.failing = failing;
    }

    pub async fn save_task_call_count(&self) -> usize {
        self.inner.lock().await.save_task_calls
    }

    pub async fn update_status_call_count(&self) -> usize {
        self.inner.lock().await.update_status_calls
    }

    pub async fn was_task_saved(&self, task_id: &str) -> bool {
        self.inner.lock().await.tasks.contains_key(task_id)
    }

    pub async fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.inner
            .lock()
            .await
            .tasks
            .get(task_id)
            .map(|row| row.task.status)
    }

    pub async fn complete_calls(&self) -> Vec<(String, i64)> {
        self.inner.lock().await.complete_calls.clone()
    }

    pub async fn fail_calls(&self) -> Vec<(String, String, i64)> {
        self.inner.lock().await.fail_calls.clone()
    }

    pub async fn dlq_calls(&self) -> Vec<(String, String)> {
        self.inner.lock().await.dlq_calls.clone()
    }

    pub async fn increment_retry_calls(&self) -> Vec<String> {
        self.inner.lock().await.increment_retry_calls.clone()
    }

    /// Execution-log rows for one task as `(attempt_number, status)` pairs.
    pub async fn execution_statuses(&self, task_id: &str) -> Vec<(u32, TaskStatus)> {
        self.inner
            .lock()
            .await
            .executions
            .iter()
            .filter(|row| row.task_id == task_id)
            .map(|row| (row.attempt_number, row.status))
            .collect()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn save_task(&self, task: &Task) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        inner.guard()?;
        inner.save_task_calls += 1;

        match inner.tasks.get_mut(&task.id) {
            Some(row) => {
                row.task.status = task.status;
                row.task.retry_count = task.retry_count;
                row.task.failure_reason = task.failure_reason.clone();
                row.task.scheduled_at = task.scheduled_at;
            }
            None => {
                inner.tasks.insert(
                    task.id.clone(),
                    HistoryRow {
                        task: task.clone(),
                        duration_ms: None,
                        worker_id: String::new(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Task, Error> {
        let inner = self.inner.lock().await;
        inner.guard()?;
        inner
            .tasks
            .get(task_id)
            .map(|row| row.task.clone())
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))
    }

    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        worker_id: &str,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        inner.guard()?;
        inner.update_status_calls += 1;

        if let Some(row) = inner.tasks.get_mut(task_id) {
            if status == TaskStatus::Running && row.task.status != TaskStatus::Running {
                row.task.started_at = Some(Utc::now());
            }
            row.task.status = status;
            row.worker_id = worker_id.to_string();
        }
        Ok(())
    }

    async fn complete_task(&self, task_id: &str, duration_ms: i64) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        inner.guard()?;
        inner
            .complete_calls
            .push((task_id.to_string(), duration_ms));

        if let Some(row) = inner.tasks.get_mut(task_id) {
            row.task.status = TaskStatus::Completed;
            row.task.completed_at = Some(Utc::now());
            row.duration_ms = Some(duration_ms);
        }
        Ok(())
    }

    async fn fail_task(&self, task_id: &str, reason: &str, duration_ms: i64) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        inner.guard()?;
        inner
            .fail_calls
            .push((task_id.to_string(), reason.to_string(), duration_ms));

        if let Some(row) = inner.tasks.get_mut(task_id) {
            row.task.status = TaskStatus::Failed;
            row.task.completed_at = Some(Utc::now());
            row.task.failure_reason = reason.to_string();
            row.task.error = reason.to_string();
            row.duration_ms = Some(duration_ms);
        }
        Ok(())
    }

    async fn move_task_to_dlq(&self, task_id: &str, reason: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        inner.guard()?;
        inner
            .dlq_calls
            .push((task_id.to_string(), reason.to_string()));

        if let Some(row) = inner.tasks.get_mut(task_id) {
            row.task.status = TaskStatus::DeadLetter;
            row.task.failure_reason = reason.to_string();
            row.task.moved_to_dlq_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn increment_retry_count(&self, task_id: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        inner.guard()?;
        inner.increment_retry_calls.push(task_id.to_string());

        if let Some(row) = inner.tasks.get_mut(task_id) {
            row.task.retry_count += 1;
        }
        Ok(())
    }

    async fn log_execution(
        &self,
        task_id: &str,
        attempt_number: u32,
        status: TaskStatus,
        duration_ms: i64,
        error_message: &str,
        worker_id: &str,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        inner.guard()?;

        let now = Utc::now();
        inner.executions.push(ExecutionRow {
            task_id: task_id.to_string(),
            attempt_number,
            status,
            started_at: now,
            completed_at: now,
            duration_ms: (duration_ms > 0).then_some(duration_ms),
            error_message: (!error_message.is_empty()).then(|| error_message.to_string()),
            worker_id: worker_id.to_string(),
        });
        Ok(())
    }

    async fn task_stats(&self, hours: i64) -> Result<Vec<TaskStats>, Error> {
        let inner = self.inner.lock().await;
        inner.guard()?;

        let cutoff = Utc::now() - chrono::Duration::hours(hours);
        let mut groups: HashMap<(String, TaskStatus), Vec<&HistoryRow>> = HashMap::new();
        for row in inner.tasks.values() {
            if row.task.created_at > cutoff {
                groups
                    .entry((row.task.task_type.clone(), row.task.status))
                    .or_default()
                    .push(row);
            }
        }

        let mut stats: Vec<TaskStats> = groups
            .into_iter()
            .map(|((task_type, status), rows)| {
                let durations: Vec<i64> = rows.iter().filter_map(|r| r.duration_ms).collect();
                let avg_duration_ms = if durations.is_empty() {
                    0.0
                } else {
                    durations.iter().sum::<i64>() as f64 / durations.len() as f64
                };
                TaskStats {
                    task_type,
                    status,
                    count: rows.len() as i64,
                    avg_duration_ms,
                    max_duration_ms: durations.iter().max().copied().unwrap_or(0),
                    min_duration_ms: durations.iter().min().copied().unwrap_or(0),
                    avg_retries: rows.iter().map(|r| r.task.retry_count as f64).sum::<f64>()
                        / rows.len() as f64,
                }
            })
            .collect();
        stats.sort_by(|a, b| {
            (a.task_type.as_str(), a.status.as_str()).cmp(&(b.task_type.as_str(), b.status.as_str()))
        });
        Ok(stats)
    }

    async fn recent_tasks(&self, limit: i64) -> Result<Vec<TaskSummary>, Error> {
        let inner = self.inner.lock().await;
        inner.guard()?;

        let mut rows: Vec<&HistoryRow> = inner.tasks.values().collect();
        rows.sort_by(|a, b| b.task.created_at.cmp(&a.task.created_at));
        Ok(rows
            .into_iter()
            .take(limit.max(0) as usize)
            .map(summary)
            .collect())
    }

    async fn tasks_by_type(&self, task_type: &str, limit: i64) -> Result<Vec<TaskSummary>, Error> {
        let inner = self.inner.lock().await;
        inner.guard()?;

        let mut rows: Vec<&HistoryRow> = inner
            .tasks
            .values()
            .filter(|row| row.task.task_type == task_type)
            .collect();
        rows.sort_by(|a, b| b.task.created_at.cmp(&a.task.created_at));
        Ok(rows
            .into_iter()
            .take(limit.max(0) as usize)
            .map(summary)
            .collect())
    }

    async fn task_history(&self, task_id: &str) -> Result<Vec<AttemptRecord>, Error> {
        let inner = self.inner.lock().await;
        inner.guard()?;

        let mut rows: Vec<&ExecutionRow> = inner
            .executions
            .iter()
            .filter(|row| row.task_id == task_id)
            .collect();
        rows.sort_by_key(|row| row.started_at);
        Ok(rows
            .into_iter()
            .map(|row| AttemptRecord {
                attempt_number: row.attempt_number as i64,
                status: row.status.as_str().to_string(),
                started_at: Some(row.started_at),
                completed_at: Some(row.completed_at),
                duration_ms: row.duration_ms,
                error_message: row.error_message.clone(),
                worker_id: row.worker_id.clone(),
            })
            .collect())
    }

    async fn report_task_summary(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TaskSummaryRow>, Error> {
        let inner = self.inner.lock().await;
        inner.guard()?;

        let mut groups: HashMap<String, Vec<&HistoryRow>> = HashMap::new();
        for row in inner.tasks.values() {
            if row.task.created_at >= start && row.task.created_at <= end {
                groups
                    .entry(row.task.task_type.clone())
                    .or_default()
                    .push(row);
            }
        }

        let mut rows: Vec<TaskSummaryRow> = groups
            .into_iter()
            .map(|(task_type, rows)| {
                let count = |status: TaskStatus| {
                    rows.iter().filter(|r| r.task.status == status).count() as i64
                };
                let durations: Vec<i64> = rows.iter().filter_map(|r| r.duration_ms).collect();
                let completed = count(TaskStatus::Completed);
                let total = rows.len() as i64;
                TaskSummaryRow {
                    task_type,
                    total,
                    completed,
                    failed: count(TaskStatus::Failed),
                    dead_lettered: count(TaskStatus::DeadLetter),
                    avg_retries: rows.iter().map(|r| r.task.retry_count as f64).sum::<f64>()
                        / total as f64,
                    avg_duration_ms: if durations.is_empty() {
                        0.0
                    } else {
                        durations.iter().sum::<i64>() as f64 / durations.len() as f64
                    },
                    max_duration_ms: durations.iter().max().copied().unwrap_or(0),
                    min_duration_ms: durations
                        .iter()
                        .filter(|d| **d > 0)
                        .min()
                        .copied()
                        .unwrap_or(0),
                    success_rate: if total == 0 {
                        0.0
                    } else {
                        (100.0 * completed as f64 / total as f64 * 100.0).round() / 100.0
                    },
                }
            })
            .collect();
        rows.sort_by(|a, b| b.total.cmp(&a.total));
        Ok(rows)
    }

    async fn report_worker_performance(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<WorkerPerformanceRow>, Error> {
        let inner = self.inner.lock().await;
        inner.guard()?;

        let mut groups: HashMap<String, Vec<&HistoryRow>> = HashMap::new();
        for row in inner.tasks.values() {
            if row.task.created_at >= start
                && row.task.created_at <= end
                && !row.worker_id.is_empty()
            {
                groups.entry(row.worker_id.clone()).or_default().push(row);
            }
        }

        let mut rows: Vec<WorkerPerformanceRow> = groups
            .into_iter()
            .map(|(worker_id, rows)| {
                let durations: Vec<i64> = rows.iter().filter_map(|r| r.duration_ms).collect();
                let completed = rows
                    .iter()
                    .filter(|r| r.task.status == TaskStatus::Completed)
                    .count() as i64;
                let total = rows.len() as i64;
                WorkerPerformanceRow {
                    worker_id,
                    tasks_processed: total,
                    completed,
                    failed: rows
                        .iter()
                        .filter(|r| r.task.status == TaskStatus::Failed)
                        .count() as i64,
                    avg_duration_ms: if durations.is_empty() {
                        0.0
                    } else {
                        durations.iter().sum::<i64>() as f64 / durations.len() as f64
                    },
                    max_duration_ms: durations.iter().max().copied().unwrap_or(0),
                    success_rate: if total == 0 {
                        0.0
                    } else {
                        (100.0 * completed as f64 / total as f64 * 100.0).round() / 100.0
                    },
                }
            })
            .collect();
        rows.sort_by(|a, b| b.tasks_processed.cmp(&a.tasks_processed));
        Ok(rows)
    }

    async fn report_failure_analysis(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<FailureAnalysisRow>, Error> {
        let inner = self.inner.lock().await;
        inner.guard()?;

        let mut groups: HashMap<(String, String), Vec<&HistoryRow>> = HashMap::new();
        for row in inner.tasks.values() {
            if row.task.created_at >= start
                && row.task.created_at <= end
                && matches!(row.task.status, TaskStatus::Failed | TaskStatus::DeadLetter)
            {
                let error = if !row.task.failure_reason.is_empty() {
                    row.task.failure_reason.clone()
                } else if !row.task.error.is_empty() {
                    row.task.error.clone()
                } else {
                    "unknown".to_string()
                };
                let error = error.chars().take(100).collect::<String>();
                groups
                    .entry((row.task.task_type.clone(), error))
                    .or_default()
                    .push(row);
            }
        }

        let mut rows: Vec<FailureAnalysisRow> = groups
            .into_iter()
            .map(|((task_type, error), rows)| FailureAnalysisRow {
                task_type,
                error,
                occurrences: rows.len() as i64,
                last_occurrence: rows
                    .iter()
                    .map(|r| r.task.created_at)
                    .max()
                    .unwrap_or_else(Utc::now),
                avg_retry_count: rows.iter().map(|r| r.task.retry_count as f64).sum::<f64>()
                    / rows.len() as f64,
            })
            .collect();
        rows.sort_by(|a, b| b.occurrences.cmp(&a.occurrences));
        rows.truncate(50);
        Ok(rows)
    }

    async fn report_hourly_breakdown(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HourlyBreakdownRow>, Error> {
        let inner = self.inner.lock().await;
        inner.guard()?;

        let mut groups: HashMap<DateTime<Utc>, Vec<&HistoryRow>> = HashMap::new();
        for row in inner.tasks.values() {
            if row.task.created_at >= start && row.task.created_at <= end {
                let hour = row
                    .task
                    .created_at
                    .with_minute(0)
                    .and_then(|t| t.with_second(0))
                    .and_then(|t| t.with_nanosecond(0))
                    .unwrap_or(row.task.created_at);
                groups.entry(hour).or_default().push(row);
            }
        }

        let mut rows: Vec<HourlyBreakdownRow> = groups
            .into_iter()
            .map(|(hour, rows)| {
                let durations: Vec<i64> = rows.iter().filter_map(|r| r.duration_ms).collect();
                HourlyBreakdownRow {
                    hour,
                    total: rows.len() as i64,
                    completed: rows
                        .iter()
                        .filter(|r| r.task.status == TaskStatus::Completed)
                        .count() as i64,
                    failed: rows
                        .iter()
                        .filter(|r| r.task.status == TaskStatus::Failed)
                        .count() as i64,
                    avg_duration_ms: if durations.is_empty() {
                        0.0
                    } else {
                        durations.iter().sum::<i64>() as f64 / durations.len() as f64
                    },
                }
            })
            .collect();
        rows.sort_by(|a, b| b.hour.cmp(&a.hour));
        Ok(rows)
    }

    async fn report_retry_analysis(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RetryAnalysisRow>, Error> {
        let inner = self.inner.lock().await;
        inner.guard()?;

        let mut groups: HashMap<(String, u32), Vec<&HistoryRow>> = HashMap::new();
        for row in inner.tasks.values() {
            if row.task.created_at >= start
                && row.task.created_at <= end
                && row.task.retry_count > 0
            {
                groups
                    .entry((row.task.task_type.clone(), row.task.retry_count))
                    .or_default()
                    .push(row);
            }
        }

        let mut rows: Vec<RetryAnalysisRow> = groups
            .into_iter()
            .map(|((task_type, retry_count), rows)| RetryAnalysisRow {
                task_type,
                retry_count: retry_count as i64,
                total: rows.len() as i64,
                eventually_succeeded: rows
                    .iter()
                    .filter(|r| r.task.status == TaskStatus::Completed)
                    .count() as i64,
                failed: rows
                    .iter()
                    .filter(|r| r.task.status == TaskStatus::Failed)
                    .count() as i64,
                dead_lettered: rows
                    .iter()
                    .filter(|r| r.task.status == TaskStatus::DeadLetter)
                    .count() as i64,
            })
            .collect();
        rows.sort_by(|a, b| (&a.task_type, a.retry_count).cmp(&(&b.task_type, b.retry_count)));
        Ok(rows)
    }
}

fn summary(row: &HistoryRow) -> TaskSummary {
    TaskSummary {
        task_id: row.task.id.clone(),
        task_type: row.task.task_type.clone(),
        status: row.task.status,
        created_at: row.task.created_at,
        completed_at: row.task.completed_at,
        duration_ms: row.duration_ms,
        retry_count: row.task.retry_count as i64,
        failure_reason: row.task.failure_reason.clone(),
    }
}
