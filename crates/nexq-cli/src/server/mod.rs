//! REST API server.

mod api;
mod dashboard;
mod error;
mod middleware;
mod reports;

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tracing::{info, warn};

use nexq_core::metrics::{
    register_metrics, DURATION_BUCKETS, TASK_DURATION, TASK_WAIT_TIME, WAIT_TIME_BUCKETS,
};
use nexq_core::queue::QueueEngine;

use crate::config::Config;

const GAUGE_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<QueueEngine>,
    pub prometheus: PrometheusHandle,
    pub reports_dir: PathBuf,
}

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the Prometheus recorder with the queue's histogram buckets.
/// Subsequent calls return the existing handle.
fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .set_buckets_for_metric(Matcher::Full(TASK_DURATION.to_string()), DURATION_BUCKETS)
                .and_then(|builder| {
                    builder.set_buckets_for_metric(
                        Matcher::Full(TASK_WAIT_TIME.to_string()),
                        WAIT_TIME_BUCKETS,
                    )
                })
                .expect("histogram buckets must not be empty")
                .install_recorder()
                .expect("failed to install prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/tasks", post(api::create_task).get(api::list_tasks))
        .route("/api/tasks/{id}", get(api::get_task))
        .route("/api/tasks/cancel/{id}", post(api::cancel_task))
        .route("/api/dashboard/stats", get(dashboard::get_stats))
        .route("/api/dashboard/history", get(dashboard::get_history))
        .route("/api/dlq/tasks", get(api::list_dlq_tasks))
        .route(
            "/api/dlq/tasks/{id}",
            get(api::get_dlq_task).delete(api::purge_dlq_task),
        )
        .route("/api/dlq/tasks/{id}/retry", post(api::retry_dlq_task))
        .route("/api/dlq/stats", get(api::dlq_stats))
        .route("/api/history/stats", get(api::history_stats))
        .route("/api/history/recent", get(api::recent_history))
        .route("/api/history/task/{id}", get(api::task_history))
        .route("/api/history/type/{type}", get(api::tasks_by_type))
        .route("/api/reports", get(reports::list_reports))
        .route(
            "/api/reports/download/{filename}",
            get(reports::download_report),
        )
        .route("/metrics", get(render_metrics))
        .layer(axum::middleware::from_fn(middleware::track_metrics))
        .with_state(state)
}

async fn render_metrics(State(state): State<AppState>) -> String {
    state.prometheus.render()
}

pub async fn run(config: Config) -> Result<()> {
    let prometheus = init_metrics();
    let (queue, _history) = crate::connect(&config).await?;

    // Keep the queue gauges fresh the way the reference server does: a
    // periodic recompute from cache scans.
    let gauge_queue = queue.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(GAUGE_REFRESH_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(err) = gauge_queue.update_gauges().await {
                warn!(%err, "failed to refresh queue gauges");
            }
        }
    });

    let state = AppState {
        queue,
        prometheus,
        reports_dir: PathBuf::from("./reports"),
    };
    let app = router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(port = config.port, "server starting");
    info!("metrics available at /metrics");

    axum::serve(listener, app)
        .with_graceful_shutdown(crate::shutdown_signal())
        .await
        .context("server error")?;

    info!("server stopped");
    Ok(())
}
