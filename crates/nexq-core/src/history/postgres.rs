//! Postgres-backed history store.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use super::models::{
    AttemptRecord, FailureAnalysisRow, HourlyBreakdownRow, RetryAnalysisRow, TaskStats,
    TaskSummary, TaskSummaryRow, WorkerPerformanceRow,
};
use super::HistoryStore;
use crate::domain::{Payload, Task, TaskPriority, TaskStatus};
use crate::error::Error;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS task_history (
    task_id         TEXT PRIMARY KEY,
    type            TEXT NOT NULL,
    payload         JSONB NOT NULL DEFAULT '{}'::jsonb,
    priority        INT NOT NULL DEFAULT 1,
    status          TEXT NOT NULL,
    retry_count     INT NOT NULL DEFAULT 0,
    failure_reason  TEXT,
    last_error      TEXT,
    created_at      TIMESTAMPTZ NOT NULL,
    scheduled_at    TIMESTAMPTZ,
    started_at      TIMESTAMPTZ,
    completed_at    TIMESTAMPTZ,
    duration_ms     BIGINT,
    worker_id       TEXT,
    moved_to_dlq_at TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS idx_task_history_created_at ON task_history (created_at);
CREATE INDEX IF NOT EXISTS idx_task_history_type ON task_history (type);

CREATE TABLE IF NOT EXISTS task_execution_log (
    id             BIGSERIAL PRIMARY KEY,
    task_id        TEXT NOT NULL,
    attempt_number INT NOT NULL,
    status         TEXT NOT NULL,
    started_at     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    completed_at   TIMESTAMPTZ,
    duration_ms    BIGINT,
    error_message  TEXT,
    worker_id      TEXT
);

CREATE INDEX IF NOT EXISTS idx_task_execution_log_task_id ON task_execution_log (task_id);
"#;

pub struct PostgresHistory {
    pool: PgPool,
}

impl PostgresHistory {
    /// Connect, verify the connection and make sure the tables exist.
    pub async fn connect(dsn: &str) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(25)
            .min_connections(5)
            .max_lifetime(Duration::from_secs(5 * 60))
            .connect(dsn)
            .await?;

        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&pool).await?;
        }

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn status_from_row(row: &sqlx::postgres::PgRow, column: &str) -> Result<TaskStatus, Error> {
    let raw: String = row.try_get(column)?;
    TaskStatus::from_str(&raw).map_err(Error::InvalidPayload)
}

fn summary_from_row(row: &sqlx::postgres::PgRow) -> Result<TaskSummary, Error> {
    Ok(TaskSummary {
        task_id: row.try_get("task_id")?,
        task_type: row.try_get("type")?,
        status: status_from_row(row, "status")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
        duration_ms: row.try_get("duration_ms")?,
        retry_count: row.try_get::<i32, _>("retry_count")? as i64,
        failure_reason: row.try_get("failure_reason")?,
    })
}

#[async_trait]
impl HistoryStore for PostgresHistory {
    async fn save_task(&self, task: &Task) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO task_history (
                task_id, type, payload, priority, status,
                retry_count, failure_reason, created_at, scheduled_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (task_id) DO UPDATE SET
                status = EXCLUDED.status,
                retry_count = EXCLUDED.retry_count,
                failure_reason = EXCLUDED.failure_reason,
                scheduled_at = EXCLUDED.scheduled_at
            "#,
        )
        .bind(&task.id)
        .bind(&task.task_type)
        .bind(serde_json::Value::Object(task.payload.clone()))
        .bind(u8::from(task.priority) as i32)
        .bind(task.status.as_str())
        .bind(task.retry_count as i32)
        .bind(&task.failure_reason)
        .bind(task.created_at)
        .bind(task.scheduled_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Task, Error> {
        let row = sqlx::query(
            r#"
            SELECT task_id, type, payload, priority, status,
                   retry_count, failure_reason, last_error, created_at,
                   scheduled_at, started_at, completed_at, moved_to_dlq_at
            FROM task_history
            WHERE task_id = $1
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;

        let payload: serde_json::Value = row.try_get("payload")?;
        let payload: Payload = match payload {
            serde_json::Value::Object(map) => map,
            _ => Payload::new(),
        };

        let priority = TaskPriority::try_from(row.try_get::<i32, _>("priority")? as u8)
            .map_err(Error::InvalidPayload)?;

        let created_at: DateTime<Utc> = row.try_get("created_at")?;

        Ok(Task {
            id: row.try_get("task_id")?,
            task_type: row.try_get("type")?,
            payload,
            priority,
            status: status_from_row(&row, "status")?,
            retry_count: row.try_get::<i32, _>("retry_count")? as u32,
            max_retries: 3,
            created_at,
            scheduled_at: row
                .try_get::<Option<DateTime<Utc>>, _>("scheduled_at")?
                .unwrap_or(created_at),
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error: row
                .try_get::<Option<String>, _>("last_error")?
                .unwrap_or_default(),
            failure_reason: row
                .try_get::<Option<String>, _>("failure_reason")?
                .unwrap_or_default(),
            moved_to_dlq_at: row.try_get("moved_to_dlq_at")?,
        })
    }

    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        worker_id: &str,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE task_history
            SET status = $1,
                started_at = CASE
                    WHEN $1 = 'running' AND status <> 'running' THEN NOW()
                    ELSE started_at
                END,
                worker_id = $2
            WHERE task_id = $3
            "#,
        )
        .bind(status.as_str())
        .bind(worker_id)
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn complete_task(&self, task_id: &str, duration_ms: i64) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE task_history
            SET status = 'completed',
                completed_at = NOW(),
                duration_ms = $1
            WHERE task_id = $2
            "#,
        )
        .bind(duration_ms)
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fail_task(&self, task_id: &str, reason: &str, duration_ms: i64) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE task_history
            SET status = 'failed',
                completed_at = NOW(),
                failure_reason = $1,
                duration_ms = $2,
                last_error = $1
            WHERE task_id = $3
            "#,
        )
        .bind(reason)
        .bind(duration_ms)
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn move_task_to_dlq(&self, task_id: &str, reason: &str) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE task_history
            SET status = 'dead_letter',
                failure_reason = $1,
                moved_to_dlq_at = NOW()
            WHERE task_id = $2
            "#,
        )
        .bind(reason)
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn increment_retry_count(&self, task_id: &str) -> Result<(), Error> {
        sqlx::query("UPDATE task_history SET retry_count = retry_count + 1 WHERE task_id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;

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
        let duration_ms = (duration_ms > 0).then_some(duration_ms);
        let error_message = (!error_message.is_empty()).then_some(error_message);

        sqlx::query(
            r#"
            INSERT INTO task_execution_log (
                task_id, attempt_number, status, completed_at,
                duration_ms, error_message, worker_id
            ) VALUES ($1, $2, $3, NOW(), $4, $5, $6)
            "#,
        )
        .bind(task_id)
        .bind(attempt_number as i32)
        .bind(status.as_str())
        .bind(duration_ms)
        .bind(error_message)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn task_stats(&self, hours: i64) -> Result<Vec<TaskStats>, Error> {
        let rows = sqlx::query(
            r#"
            SELECT type, status, COUNT(*) AS count,
                   COALESCE(AVG(duration_ms), 0)::FLOAT8 AS avg_duration_ms,
                   COALESCE(MAX(duration_ms), 0)::BIGINT AS max_duration_ms,
                   COALESCE(MIN(duration_ms), 0)::BIGINT AS min_duration_ms,
                   COALESCE(AVG(retry_count), 0)::FLOAT8 AS avg_retries
            FROM task_history
            WHERE created_at > NOW() - $1::BIGINT * INTERVAL '1 hour'
            GROUP BY type, status
            ORDER BY type, status
            "#,
        )
        .bind(hours)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(TaskStats {
                    task_type: row.try_get("type")?,
                    status: status_from_row(row, "status")?,
                    count: row.try_get("count")?,
                    avg_duration_ms: row.try_get("avg_duration_ms")?,
                    max_duration_ms: row.try_get("max_duration_ms")?,
                    min_duration_ms: row.try_get("min_duration_ms")?,
                    avg_retries: row.try_get("avg_retries")?,
                })
            })
            .collect()
    }

    async fn recent_tasks(&self, limit: i64) -> Result<Vec<TaskSummary>, Error> {
        let rows = sqlx::query(
            r#"
            SELECT task_id, type, status, created_at, completed_at,
                   duration_ms, retry_count, COALESCE(failure_reason, '') AS failure_reason
            FROM task_history
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(summary_from_row).collect()
    }

    async fn tasks_by_type(&self, task_type: &str, limit: i64) -> Result<Vec<TaskSummary>, Error> {
        let rows = sqlx::query(
            r#"
            SELECT task_id, type, status, created_at, completed_at,
                   duration_ms, retry_count, COALESCE(failure_reason, '') AS failure_reason
            FROM task_history
            WHERE type = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(task_type)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(summary_from_row).collect()
    }

    async fn task_history(&self, task_id: &str) -> Result<Vec<AttemptRecord>, Error> {
        let rows = sqlx::query(
            r#"
            SELECT attempt_number, status, started_at, completed_at,
                   duration_ms, error_message, COALESCE(worker_id, '') AS worker_id
            FROM task_execution_log
            WHERE task_id = $1
            ORDER BY started_at ASC
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(AttemptRecord {
                    attempt_number: row.try_get::<i32, _>("attempt_number")? as i64,
                    status: row.try_get("status")?,
                    started_at: row.try_get("started_at")?,
                    completed_at: row.try_get("completed_at")?,
                    duration_ms: row.try_get("duration_ms")?,
                    error_message: row.try_get("error_message")?,
                    worker_id: row.try_get("worker_id")?,
                })
            })
            .collect()
    }

    async fn report_task_summary(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TaskSummaryRow>, Error> {
        let rows = sqlx::query(
            r#"
            SELECT type,
                   COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                   COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                   COUNT(*) FILTER (WHERE status = 'dead_letter') AS dead_lettered,
                   COALESCE(AVG(retry_count), 0)::FLOAT8 AS avg_retries,
                   COALESCE(AVG(duration_ms) FILTER (WHERE duration_ms IS NOT NULL), 0)::FLOAT8
                       AS avg_duration_ms,
                   COALESCE(MAX(duration_ms), 0)::BIGINT AS max_duration_ms,
                   COALESCE(MIN(duration_ms) FILTER (WHERE duration_ms > 0), 0)::BIGINT
                       AS min_duration_ms,
                   COALESCE(ROUND(100.0 * COUNT(*) FILTER (WHERE status = 'completed')
                       / NULLIF(COUNT(*), 0), 2), 0)::FLOAT8 AS success_rate
            FROM task_history
            WHERE created_at BETWEEN $1 AND $2
            GROUP BY type
            ORDER BY total DESC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(TaskSummaryRow {
                    task_type: row.try_get("type")?,
                    total: row.try_get("total")?,
                    completed: row.try_get("completed")?,
                    failed: row.try_get("failed")?,
                    dead_lettered: row.try_get("dead_lettered")?,
                    avg_retries: row.try_get("avg_retries")?,
                    avg_duration_ms: row.try_get("avg_duration_ms")?,
                    max_duration_ms: row.try_get("max_duration_ms")?,
                    min_duration_ms: row.try_get("min_duration_ms")?,
                    success_rate: row.try_get("success_rate")?,
                })
            })
            .collect()
    }

    async fn report_worker_performance(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<WorkerPerformanceRow>, Error> {
        let rows = sqlx::query(
            r#"
            SELECT COALESCE(worker_id, 'unknown') AS worker_id,
                   COUNT(*) AS tasks_processed,
                   COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                   COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                   COALESCE(AVG(duration_ms) FILTER (WHERE duration_ms IS NOT NULL), 0)::FLOAT8
                       AS avg_duration_ms,
                   COALESCE(MAX(duration_ms), 0)::BIGINT AS max_duration_ms,
                   COALESCE(ROUND(100.0 * COUNT(*) FILTER (WHERE status = 'completed')
                       / NULLIF(COUNT(*), 0), 2), 0)::FLOAT8 AS success_rate
            FROM task_history
            WHERE created_at BETWEEN $1 AND $2
              AND worker_id IS NOT NULL
            GROUP BY worker_id
            ORDER BY tasks_processed DESC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(WorkerPerformanceRow {
                    worker_id: row.try_get("worker_id")?,
                    tasks_processed: row.try_get("tasks_processed")?,
                    completed: row.try_get("completed")?,
                    failed: row.try_get("failed")?,
                    avg_duration_ms: row.try_get("avg_duration_ms")?,
                    max_duration_ms: row.try_get("max_duration_ms")?,
                    success_rate: row.try_get("success_rate")?,
                })
            })
            .collect()
    }

    async fn report_failure_analysis(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<FailureAnalysisRow>, Error> {
        let rows = sqlx::query(
            r#"
            SELECT type,
                   LEFT(COALESCE(failure_reason, last_error, 'unknown'), 100) AS error,
                   COUNT(*) AS occurrences,
                   MAX(created_at) AS last_occurrence,
                   COALESCE(AVG(retry_count), 0)::FLOAT8 AS avg_retry_count
            FROM task_history
            WHERE created_at BETWEEN $1 AND $2
              AND status IN ('failed', 'dead_letter')
            GROUP BY type, LEFT(COALESCE(failure_reason, last_error, 'unknown'), 100)
            ORDER BY occurrences DESC
            LIMIT 50
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(FailureAnalysisRow {
                    task_type: row.try_get("type")?,
                    error: row.try_get("error")?,
                    occurrences: row.try_get("occurrences")?,
                    last_occurrence: row.try_get("last_occurrence")?,
                    avg_retry_count: row.try_get("avg_retry_count")?,
                })
            })
            .collect()
    }

    async fn report_hourly_breakdown(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HourlyBreakdownRow>, Error> {
        let rows = sqlx::query(
            r#"
            SELECT DATE_TRUNC('hour', created_at) AS hour,
                   COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                   COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                   COALESCE(AVG(duration_ms) FILTER (WHERE duration_ms IS NOT NULL), 0)::FLOAT8
                       AS avg_duration_ms
            FROM task_history
            WHERE created_at BETWEEN $1 AND $2
            GROUP BY DATE_TRUNC('hour', created_at)
            ORDER BY hour DESC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(HourlyBreakdownRow {
                    hour: row.try_get("hour")?,
                    total: row.try_get("total")?,
                    completed: row.try_get("completed")?,
                    failed: row.try_get("failed")?,
                    avg_duration_ms: row.try_get("avg_duration_ms")?,
                })
            })
            .collect()
    }

    async fn report_retry_analysis(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RetryAnalysisRow>, Error> {
        let rows = sqlx::query(
            r#"
            SELECT type, retry_count,
                   COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE status = 'completed') AS eventually_succeeded,
                   COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                   COUNT(*) FILTER (WHERE status = 'dead_letter') AS dead_lettered
            FROM task_history
            WHERE created_at BETWEEN $1 AND $2
              AND retry_count > 0
            GROUP BY type, retry_count
            ORDER BY type, retry_count
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(RetryAnalysisRow {
                    task_type: row.try_get("type")?,
                    retry_count: row.try_get::<i32, _>("retry_count")? as i64,
                    total: row.try_get("total")?,
                    eventually_succeeded: row.try_get("eventually_succeeded")?,
                    failed: row.try_get("failed")?,
                    dead_lettered: row.try_get("dead_lettered")?,
                })
            })
            .collect()
    }
}
