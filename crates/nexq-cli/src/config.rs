//! Environment-driven configuration.

use anyhow::{bail, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Cache address (`POGOCACHE_ADDR`), `host:port`.
    pub cache_addr: String,

    /// History store DSN (`POSTGRES_DSN`). Required: the reference
    /// deployment aborts at startup without it.
    pub postgres_dsn: String,

    /// Worker identity (`WORKER_ID`).
    pub worker_id: String,

    /// HTTP port for the server (`PORT`).
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let cache_addr = env_or("POGOCACHE_ADDR", "localhost:9401");

        let postgres_dsn = match std::env::var("POSTGRES_DSN") {
            Ok(dsn) if !dsn.is_empty() => dsn,
            _ => bail!("POSTGRES_DSN is required"),
        };

        let worker_id = env_or(
            "WORKER_ID",
            &format!("worker-{}", chrono::Utc::now().timestamp()),
        );

        let port = match std::env::var("PORT") {
            Ok(raw) if !raw.is_empty() => raw
                .parse::<u16>()
                .map_err(|_| anyhow::anyhow!("invalid PORT: {raw}"))?,
            _ => 8080,
        };

        Ok(Self {
            cache_addr,
            postgres_dsn,
            worker_id,
            port,
        })
    }
}

fn env_or(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}
