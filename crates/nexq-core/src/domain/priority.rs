use serde::{Deserialize, Serialize};
use std::fmt;

/// Task priority band. Higher bands are dequeued first.
///
/// Wire form is the integer 0 / 1 / 2 so producers in any language can set it.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(into = "u8", try_from = "u8")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
}

impl TaskPriority {
    pub fn label(self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl From<TaskPriority> for u8 {
    fn from(priority: TaskPriority) -> Self {
        match priority {
            TaskPriority::Low => 0,
            TaskPriority::Medium => 1,
            TaskPriority::High => 2,
        }
    }
}

impl TryFrom<u8> for TaskPriority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TaskPriority::Low),
            1 => Ok(TaskPriority::Medium),
            2 => Ok(TaskPriority::High),
            other => Err(format!("invalid priority: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_are_ordered() {
        assert!(TaskPriority::Low < TaskPriority::Medium);
        assert!(TaskPriority::Medium < TaskPriority::High);
    }

    #[test]
    fn labels() {
        assert_eq!(TaskPriority::Low.label(), "low");
        assert_eq!(TaskPriority::Medium.label(), "medium");
        assert_eq!(TaskPriority::High.label(), "high");
    }

    #[test]
    fn integer_wire_form() {
        let json = serde_json::to_string(&TaskPriority::High).unwrap();
        assert_eq!(json, "2");

        let parsed: TaskPriority = serde_json::from_str("0").unwrap();
        assert_eq!(parsed, TaskPriority::Low);

        assert!(serde_json::from_str::<TaskPriority>("7").is_err());
    }
}
