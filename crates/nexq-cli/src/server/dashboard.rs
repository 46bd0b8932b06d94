//! Dashboard aggregation over cache-visible tasks.

use std::collections::HashMap;

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use nexq_core::domain::TaskStatus;

use super::error::ApiError;
use super::AppState;

#[derive(Debug, Serialize)]
pub struct Stats {
    pub total_tasks: usize,
    pub pending_tasks: usize,
    pub running_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub dead_letter_tasks: usize,
    pub tasks_by_type: HashMap<String, usize>,
    pub average_wait_time: String,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct HistoryEntry {
    pub task_id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration: String,
}

pub async fn get_stats(State(state): State<AppState>) -> Result<Json<Stats>, ApiError> {
    let tasks = state.queue.get_all_tasks().await?;

    let mut stats = Stats {
        total_tasks: tasks.len(),
        pending_tasks: 0,
        running_tasks: 0,
        completed_tasks: 0,
        failed_tasks: 0,
        dead_letter_tasks: 0,
        tasks_by_type: HashMap::new(),
        average_wait_time: "N/A".to_string(),
        last_updated: Utc::now(),
    };

    let mut total_wait = Duration::zero();
    let mut wait_samples = 0u32;

    for task in &tasks {
        match task.status {
            TaskStatus::Pending => stats.pending_tasks += 1,
            TaskStatus::Running => stats.running_tasks += 1,
            TaskStatus::Completed => stats.completed_tasks += 1,
            TaskStatus::Failed => stats.failed_tasks += 1,
            TaskStatus::DeadLetter => stats.dead_letter_tasks += 1,
            TaskStatus::Cancelled => {}
        }

        *stats.tasks_by_type.entry(task.task_type.clone()).or_default() += 1;

        if let Some(started_at) = task.started_at {
            total_wait = total_wait + (started_at - task.created_at);
            wait_samples += 1;
        }
    }

    if wait_samples > 0 {
        stats.average_wait_time = format_duration(total_wait / wait_samples as i32);
    }

    Ok(Json(stats))
}

/// Completed or failed tasks from the last 24 hours.
pub async fn get_history(State(state): State<AppState>) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    let tasks = state.queue.get_all_tasks().await?;
    let cutoff = Utc::now() - Duration::hours(24);

    let mut history = Vec::new();
    for task in tasks {
        let Some(completed_at) = task.completed_at else {
            continue;
        };
        if completed_at < cutoff {
            continue;
        }

        let duration = task
            .started_at
            .map(|started_at| format_duration(completed_at - started_at))
            .unwrap_or_default();

        history.push(HistoryEntry {
            task_id: task.id,
            task_type: task.task_type,
            status: task.status,
            created_at: task.created_at,
            completed_at: Some(completed_at),
            duration,
        });
    }

    Ok(Json(history))
}

fn format_duration(duration: Duration) -> String {
    let ms = duration.num_milliseconds().max(0);
    if ms < 1_000 {
        format!("{ms}ms")
    } else {
        format!("{:.2}s", ms as f64 / 1_000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_are_human_readable() {
        assert_eq!(format_duration(Duration::milliseconds(250)), "250ms");
        assert_eq!(format_duration(Duration::milliseconds(1_500)), "1.50s");
        assert_eq!(format_duration(Duration::milliseconds(-5)), "0ms");
    }
}
