use thiserror::Error;

use crate::domain::TaskStatus;

#[derive(Debug, Error)]
pub enum Error {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("cannot cancel task {id}: status is {status}")]
    CannotCancel { id: String, status: TaskStatus },

    #[error("cache error: {0}")]
    Cache(String),

    #[error("history error: {0}")]
    History(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("unsupported report type: {0}")]
    UnsupportedReport(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("{0}")]
    Handler(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Cache(err.to_string())
    }
}
