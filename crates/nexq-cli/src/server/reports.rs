//! Generated report listing and download.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::ApiError;
use super::AppState;

#[derive(Debug, Serialize)]
pub struct ReportFile {
    pub filename: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// An unreadable or missing reports directory is an empty listing, not an
/// error: reports only exist once a report task has run.
pub async fn list_reports(State(state): State<AppState>) -> Json<Vec<ReportFile>> {
    let mut reports = Vec::new();

    let Ok(mut entries) = tokio::fs::read_dir(&state.reports_dir).await else {
        return Json(reports);
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if metadata.is_dir() {
            continue;
        }

        let created_at = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        reports.push(ReportFile {
            filename: entry.file_name().to_string_lossy().into_owned(),
            size: metadata.len(),
            created_at,
        });
    }

    Json(reports)
}

pub async fn download_report(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    if filename.is_empty() {
        return Err(ApiError::bad_request("Filename required"));
    }
    if filename.contains("..") || filename.contains('/') {
        return Err(ApiError::bad_request("Invalid filename"));
    }

    let path = state.reports_dir.join(&filename);
    let metadata = tokio::fs::metadata(&path)
        .await
        .map_err(|_| ApiError::not_found("File not found"))?;
    if metadata.is_dir() {
        return Err(ApiError::bad_request("Invalid file"));
    }

    let content = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError::not_found("File not found"))?;

    let content_type = if filename.ends_with(".csv") {
        "text/csv"
    } else if filename.ends_with(".json") {
        "application/json"
    } else {
        "application/octet-stream"
    };

    Ok((
        StatusCode::OK,
        [
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={filename}"),
            ),
            (header::CONTENT_TYPE, content_type.to_string()),
        ],
        content,
    )
        .into_response())
}
