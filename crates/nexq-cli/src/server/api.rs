//! Task, DLQ and history endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;

use nexq_core::domain::{Payload, Task, TaskPriority};

use super::error::ApiError;
use super::AppState;

const HISTORY_UNAVAILABLE: &str = "History not available (PostgreSQL not configured)";

#[derive(Debug, Deserialize)]
pub struct TaskRequest {
    #[serde(rename = "type")]
    task_type: Option<String>,
    #[serde(default)]
    payload: Payload,
    priority: Option<TaskPriority>,
    schedule_in: Option<i64>,
}

pub async fn create_task(
    State(state): State<AppState>,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let request: TaskRequest =
        serde_json::from_slice(&body).map_err(|_| ApiError::bad_request("Invalid JSON"))?;

    let task_type = request
        .task_type
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::bad_request("Task type is required"))?;

    let mut task = Task::new(
        task_type,
        request.payload,
        request.priority.unwrap_or_default(),
    );
    if let Some(seconds) = request.schedule_in {
        task.scheduled_at = Utc::now() + chrono::Duration::seconds(seconds);
    }

    state.queue.enqueue(&task).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn list_tasks(State(state): State<AppState>) -> Result<Json<Vec<Task>>, ApiError> {
    Ok(Json(state.queue.get_all_tasks().await?))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.queue.get_task(&id).await?))
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.queue.cancel_task(&id).await?;
    Ok(Json(serde_json::json!({
        "message": "Task cancelled successfully",
        "task_id": id,
    })))
}

pub async fn list_dlq_tasks(State(state): State<AppState>) -> Result<Json<Vec<Task>>, ApiError> {
    Ok(Json(state.queue.get_dead_letter_tasks().await?))
}

pub async fn get_dlq_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.queue.get_dead_letter_task(&id).await?))
}

pub async fn purge_dlq_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.queue.purge_dead_letter(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn retry_dlq_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.queue.retry_dead_letter(&id).await?;
    Ok(Json(serde_json::json!({
        "message": "Task moved back to queue for retry",
        "task_id": id,
    })))
}

pub async fn dlq_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.queue.dead_letter_stats().await?))
}

#[derive(Debug, Deserialize)]
pub struct HoursQuery {
    hours: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    limit: Option<i64>,
}

pub async fn history_stats(
    State(state): State<AppState>,
    Query(query): Query<HoursQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let history = state
        .queue
        .history()
        .ok_or_else(|| ApiError::service_unavailable(HISTORY_UNAVAILABLE))?;

    let stats = history.task_stats(query.hours.unwrap_or(24)).await?;
    Ok(Json(stats))
}

pub async fn recent_history(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let history = state
        .queue
        .history()
        .ok_or_else(|| ApiError::service_unavailable(HISTORY_UNAVAILABLE))?;

    let tasks = history.recent_tasks(query.limit.unwrap_or(100)).await?;
    Ok(Json(tasks))
}

pub async fn task_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let history = state
        .queue
        .history()
        .ok_or_else(|| ApiError::service_unavailable(HISTORY_UNAVAILABLE))?;

    let log = history.task_history(&id).await?;
    Ok(Json(log))
}

pub async fn tasks_by_type(
    State(state): State<AppState>,
    Path(task_type): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let history = state
        .queue
        .history()
        .ok_or_else(|| ApiError::service_unavailable(HISTORY_UNAVAILABLE))?;

    let tasks = history
        .tasks_by_type(&task_type, query.limit.unwrap_or(100))
        .await?;
    Ok(Json(tasks))
}
