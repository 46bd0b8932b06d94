use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use nexq_core::cache::RedisKv;
use nexq_core::handlers::ReportHandler;
use nexq_core::history::{HistoryStore, PostgresHistory};
use nexq_core::queue::QueueEngine;
use nexq_core::runtime::HandlerRegistry;
use nexq_core::worker::Worker;

mod config;
mod server;

use config::Config;

#[derive(Parser)]
#[command(name = "nexq", about = "Distributed background job queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the REST API server with metrics exposition.
    Server,
    /// Run a worker that polls the queue and executes registered handlers.
    Worker,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Server => server::run(config).await,
        Command::Worker => run_worker(config).await,
    }
}

async fn connect(config: &Config) -> Result<(Arc<QueueEngine>, Arc<dyn HistoryStore>)> {
    let history = PostgresHistory::connect(&config.postgres_dsn)
        .await
        .context("failed to connect to PostgreSQL")?;
    let history: Arc<dyn HistoryStore> = Arc::new(history);

    let kv = RedisKv::connect(&config.cache_addr)
        .await
        .with_context(|| format!("failed to connect to cache at {}", config.cache_addr))?;
    info!(addr = %config.cache_addr, "connected to Pogocache");

    let queue = Arc::new(QueueEngine::new(Arc::new(kv), Some(history.clone())));
    Ok((queue, history))
}

async fn run_worker(config: Config) -> Result<()> {
    let (queue, history) = connect(&config).await?;

    let mut registry = HandlerRegistry::new();
    registry.register("generate_report", Arc::new(ReportHandler::new(history)));

    let worker = Arc::new(Worker::new(
        config.worker_id.clone(),
        queue,
        Arc::new(registry),
    ));
    let shutdown = worker.shutdown_token();

    let run = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run().await }
    });

    shutdown_signal().await;
    info!("shutting down worker");
    shutdown.cancel();
    run.await?;

    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
