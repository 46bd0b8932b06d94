//! Report generation handler.
//!
//! Demonstrates the handler contract for long-running, cancellable work: an
//! optional delay raced against the context, history queries, and CSV/JSON
//! file output. All storage access goes through `HistoryStore`, so the
//! handler does not care which SQL flavour sits behind it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::info;

use crate::domain::{Payload, Task};
use crate::error::Error;
use crate::history::HistoryStore;
use crate::runtime::{HandlerContext, TaskHandler};

const REPORT_TYPES: &[&str] = &[
    "task_summary",
    "worker_performance",
    "failure_analysis",
    "hourly_breakdown",
    "retry_analysis",
];

#[derive(Debug, Deserialize)]
struct ReportPayload {
    #[serde(default)]
    report_type: String,
    #[serde(default)]
    start_time: String,
    #[serde(default)]
    end_time: String,
    #[serde(default)]
    format: String,
    #[serde(default)]
    output_path: String,
    #[serde(default)]
    schedule_in: u64,
}

pub struct ReportHandler {
    history: Arc<dyn HistoryStore>,
}

impl ReportHandler {
    pub fn new(history: Arc<dyn HistoryStore>) -> Self {
        Self { history }
    }

    async fn generate(
        &self,
        report_type: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Vec<String>>, Error> {
        match report_type {
            "task_summary" => {
                let mut data = vec![header(&[
                    "Task Type",
                    "Total",
                    "Completed",
                    "Failed",
                    "DLQ",
                    "Avg Retries",
                    "Avg Duration (ms)",
                    "Max Duration (ms)",
                    "Min Duration (ms)",
                    "Success Rate (%)",
                ])];
                for row in self.history.report_task_summary(start, end).await? {
                    data.push(vec![
                        row.task_type,
                        row.total.to_string(),
                        row.completed.to_string(),
                        row.failed.to_string(),
                        row.dead_lettered.to_string(),
                        format!("{:.2}", row.avg_retries),
                        format!("{:.0}", row.avg_duration_ms),
                        row.max_duration_ms.to_string(),
                        row.min_duration_ms.to_string(),
                        format!("{:.2}", row.success_rate),
                    ]);
                }
                Ok(data)
            }
            "worker_performance" => {
                let mut data = vec![header(&[
                    "Worker ID",
                    "Tasks Processed",
                    "Completed",
                    "Failed",
                    "Avg Duration (ms)",
                    "Max Duration (ms)",
                    "Success Rate (%)",
                ])];
                for row in self.history.report_worker_performance(start, end).await? {
                    data.push(vec![
                        row.worker_id,
                        row.tasks_processed.to_string(),
                        row.completed.to_string(),
                        row.failed.to_string(),
                        format!("{:.0}", row.avg_duration_ms),
                        row.max_duration_ms.to_string(),
                        format!("{:.2}", row.success_rate),
                    ]);
                }
                Ok(data)
            }
            "failure_analysis" => {
                let mut data = vec![header(&[
                    "Task Type",
                    "Error",
                    "Occurrences",
                    "Last Occurrence",
                    "Avg Retry Count",
                ])];
                for row in self.history.report_failure_analysis(start, end).await? {
                    data.push(vec![
                        row.task_type,
                        row.error,
                        row.occurrences.to_string(),
                        row.last_occurrence.format("%Y-%m-%d %H:%M:%S").to_string(),
                        format!("{:.2}", row.avg_retry_count),
                    ]);
                }
                Ok(data)
            }
            "hourly_breakdown" => {
                let mut data = vec![header(&[
                    "Hour",
                    "Total Tasks",
                    "Completed",
                    "Failed",
                    "Avg Duration (ms)",
                ])];
                for row in self.history.report_hourly_breakdown(start, end).await? {
                    data.push(vec![
                        row.hour.format("%Y-%m-%d %H:00").to_string(),
                        row.total.to_string(),
                        row.completed.to_string(),
                        row.failed.to_string(),
                        format!("{:.0}", row.avg_duration_ms),
                    ]);
                }
                Ok(data)
            }
            "retry_analysis" => {
                let mut data = vec![header(&[
                    "Task Type",
                    "Retry Count",
                    "Total",
                    "Eventually Succeeded",
                    "Failed",
                    "Moved to DLQ",
                ])];
                for row in self.history.report_retry_analysis(start, end).await? {
                    data.push(vec![
                        row.task_type,
                        row.retry_count.to_string(),
                        row.total.to_string(),
                        row.eventually_succeeded.to_string(),
                        row.failed.to_string(),
                        row.dead_lettered.to_string(),
                    ]);
                }
                Ok(data)
            }
            other => Err(Error::UnsupportedReport(format!(
                "{other} (available: {})",
                REPORT_TYPES.join(", ")
            ))),
        }
    }
}

#[async_trait]
impl TaskHandler for ReportHandler {
    async fn handle(&self, ctx: &HandlerContext, task: &Task) -> Result<(), Error> {
        let payload = parse_payload(&task.payload)?;

        if payload.schedule_in > 0 {
            info!(
                task_id = %task.id,
                delay_secs = payload.schedule_in,
                "delaying report generation"
            );
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(payload.schedule_in)) => {}
                _ = ctx.cancelled() => {
                    info!(task_id = %task.id, "task cancelled during delay");
                    return Err(Error::Cancelled);
                }
            }
        }

        let (start, end) = parse_time_range(&payload)?;
        info!(
            task_id = %task.id,
            report_type = %payload.report_type,
            format = %payload.format,
            "generating report"
        );

        let data = self.generate(&payload.report_type, start, end).await?;

        if ctx.is_cancelled() {
            info!(task_id = %task.id, "task cancelled after data generation");
            return Err(Error::Cancelled);
        }

        let output_file = save_report(&payload, &data).await?;
        info!(
            task_id = %task.id,
            file = %output_file.display(),
            rows = data.len().saturating_sub(1),
            "report generated"
        );
        Ok(())
    }
}

fn header(columns: &[&str]) -> Vec<String> {
    columns.iter().map(|c| c.to_string()).collect()
}

fn parse_payload(payload: &Payload) -> Result<ReportPayload, Error> {
    let mut parsed: ReportPayload =
        serde_json::from_value(serde_json::Value::Object(payload.clone()))
            .map_err(|err| Error::InvalidPayload(err.to_string()))?;

    if parsed.report_type.is_empty() {
        return Err(Error::InvalidPayload(
            "missing required field: report_type".to_string(),
        ));
    }
    if parsed.output_path.is_empty() {
        parsed.output_path = "./reports".to_string();
    }
    if parsed.format.is_empty() {
        parsed.format = "csv".to_string();
    }

    Ok(parsed)
}

fn parse_time_range(payload: &ReportPayload) -> Result<(DateTime<Utc>, DateTime<Utc>), Error> {
    let start = if payload.start_time.is_empty() {
        Utc::now() - Duration::hours(24)
    } else {
        DateTime::parse_from_rfc3339(&payload.start_time)
            .map_err(|err| Error::InvalidPayload(format!("invalid start_time: {err}")))?
            .with_timezone(&Utc)
    };

    let end = if payload.end_time.is_empty() {
        Utc::now()
    } else {
        DateTime::parse_from_rfc3339(&payload.end_time)
            .map_err(|err| Error::InvalidPayload(format!("invalid end_time: {err}")))?
            .with_timezone(&Utc)
    };

    Ok((start, end))
}

async fn save_report(payload: &ReportPayload, data: &[Vec<String>]) -> Result<PathBuf, Error> {
    tokio::fs::create_dir_all(&payload.output_path).await?;

    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let filename = format!("nexq_{}_{}.{}", payload.report_type, timestamp, payload.format);
    let full_path = Path::new(&payload.output_path).join(filename);

    match payload.format.as_str() {
        "csv" => tokio::fs::write(&full_path, render_csv(data)).await?,
        "json" => tokio::fs::write(&full_path, render_json(data)?).await?,
        other => {
            return Err(Error::InvalidPayload(format!("unsupported format: {other}")));
        }
    }

    Ok(full_path)
}

fn render_csv(data: &[Vec<String>]) -> String {
    let mut out = String::new();
    for row in data {
        let line: Vec<String> = row.iter().map(|field| csv_field(field)).collect();
        out.push_str(&line.join(","));
        out.push('\n');
    }
    out
}

fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn render_json(data: &[Vec<String>]) -> Result<String, Error> {
    // A header alone is no report.
    if data.len() < 2 {
        return Err(Error::Handler(
            "insufficient data for JSON export".to_string(),
        ));
    }

    let headers = &data[0];
    let records: Vec<serde_json::Value> = data[1..]
        .iter()
        .map(|row| {
            let map: serde_json::Map<String, serde_json::Value> = headers
                .iter()
                .zip(row.iter())
                .map(|(header, value)| (header.clone(), serde_json::json!(value)))
                .collect();
            serde_json::Value::Object(map)
        })
        .collect();

    let doc = serde_json::json!({
        "generated_at": Utc::now().to_rfc3339(),
        "data": records,
        "total_rows": records.len(),
    });
    Ok(serde_json::to_string_pretty(&doc)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskPriority;
    use crate::history::{HistoryStore, MemoryHistory};
    use tokio_util::sync::CancellationToken;

    fn report_task(payload: &[(&str, serde_json::Value)]) -> Task {
        let payload: Payload = payload
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        Task::new("generate_report", payload, TaskPriority::Medium)
    }

    fn ctx() -> (HandlerContext, CancellationToken) {
        let token = CancellationToken::new();
        let ctx = HandlerContext::new(token.clone(), Utc::now() + Duration::minutes(5));
        (ctx, token)
    }

    async fn seeded_history() -> Arc<MemoryHistory> {
        let history = Arc::new(MemoryHistory::new());
        let completed = Task::new("send_email", Payload::new(), TaskPriority::Medium);
        history.save_task(&completed).await.unwrap();
        history.complete_task(&completed.id, 120).await.unwrap();

        let mut failed = Task::new("send_email", Payload::new(), TaskPriority::Low);
        failed.retry_count = 2;
        history.save_task(&failed).await.unwrap();
        history.fail_task(&failed.id, "smtp down", 30).await.unwrap();
        history
    }

    #[tokio::test]
    async fn unknown_report_type_is_rejected() {
        let handler = ReportHandler::new(seeded_history().await);
        let task = report_task(&[("report_type", serde_json::json!("quarterly_vibes"))]);
        let (ctx, _) = ctx();

        match handler.handle(&ctx, &task).await {
            Err(Error::UnsupportedReport(msg)) => assert!(msg.contains("quarterly_vibes")),
            other => panic!("expected UnsupportedReport, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_report_type_is_invalid_payload() {
        let handler = ReportHandler::new(seeded_history().await);
        let task = report_task(&[]);
        let (ctx, _) = ctx();

        assert!(matches!(
            handler.handle(&ctx, &task).await,
            Err(Error::InvalidPayload(_))
        ));
    }

    #[tokio::test]
    async fn writes_a_csv_report_file() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ReportHandler::new(seeded_history().await);
        let task = report_task(&[
            ("report_type", serde_json::json!("task_summary")),
            (
                "output_path",
                serde_json::json!(dir.path().to_str().unwrap()),
            ),
        ]);
        let (ctx, _) = ctx();

        handler.handle(&ctx, &task).await.unwrap();

        let mut entries = std::fs::read_dir(dir.path()).unwrap();
        let file = entries.next().unwrap().unwrap();
        let name = file.file_name().into_string().unwrap();
        assert!(name.starts_with("nexq_task_summary_"));
        assert!(name.ends_with(".csv"));

        let content = std::fs::read_to_string(file.path()).unwrap();
        let mut lines = content.lines();
        assert!(lines.next().unwrap().starts_with("Task Type,Total,"));
        assert!(content.contains("send_email"));
    }

    #[tokio::test]
    async fn json_report_with_no_rows_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        // Empty history: every report has a header and nothing else.
        let handler = ReportHandler::new(Arc::new(MemoryHistory::new()));
        let task = report_task(&[
            ("report_type", serde_json::json!("worker_performance")),
            ("format", serde_json::json!("json")),
            (
                "output_path",
                serde_json::json!(dir.path().to_str().unwrap()),
            ),
        ]);
        let (ctx, _) = ctx();

        assert!(handler.handle(&ctx, &task).await.is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn cancellation_during_delay_returns_promptly_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ReportHandler::new(seeded_history().await);
        let task = report_task(&[
            ("report_type", serde_json::json!("task_summary")),
            ("schedule_in", serde_json::json!(60)),
            (
                "output_path",
                serde_json::json!(dir.path().to_str().unwrap()),
            ),
        ]);
        let (ctx, token) = ctx();

        let cancel = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            token.cancel();
        });

        let started = std::time::Instant::now();
        let result = handler.handle(&ctx, &task).await;
        cancel.await.unwrap();

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(
            started.elapsed() < std::time::Duration::from_secs(2),
            "handler must not wait out the full delay"
        );
        assert_eq!(
            std::fs::read_dir(dir.path()).unwrap().count(),
            0,
            "no output file on cancellation"
        );
    }

    #[test]
    fn csv_fields_are_quoted_when_needed() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("line\nbreak"), "\"line\nbreak\"");
    }
}
