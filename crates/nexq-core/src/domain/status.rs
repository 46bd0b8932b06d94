use serde::{Deserialize, Serialize};
use std::fmt;

/// Task lifecycle state.
///
/// Transitions:
/// - pending -> running (dequeue)
/// - running -> completed | cancelled
/// - running -> failed -> pending (retry remaining)
/// - running -> failed -> dead_letter (retries exhausted)
/// - pending -> cancelled (cancel before dequeue)
/// - dead_letter -> pending (explicit DLQ retry)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    DeadLetter,
}

impl TaskStatus {
    /// Terminal states admit no further transitions; `Failed` is transient
    /// between attempts and is deliberately not terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::DeadLetter
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::DeadLetter => "dead_letter",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            "dead_letter" => Ok(TaskStatus::DeadLetter),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}
