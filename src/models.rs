// src/models.rs

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier handed out by the manager, unique for the manager's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl TaskId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for TaskId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DL-{}", self.0)
    }
}

/// The status of a download task.
///
/// `Completed`, `Failed` and `Canceled` are terminal: once reached, the
/// status never changes again.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Submitted, waiting for a free worker slot.
    Pending,
    InProgress,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Whether cancellation may still act on a task in this status.
    pub fn is_cancelable(self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::InProgress => 1,
            Self::Completed => 2,
            Self::Failed => 3,
            Self::Canceled => 4,
        }
    }

    pub(crate) fn from_u8(tag: u8) -> Self {
        match tag {
            0 => Self::Pending,
            1 => Self::InProgress,
            2 => Self::Completed,
            4 => Self::Canceled,
            // Only tags written by `to_u8` ever reach the state cell.
            _ => Self::Failed,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        };
        f.write_str(name)
    }
}

/// A consistent point-in-time view of one task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub url: String,
    pub status: TaskStatus,
    /// Percent in `0..=100`.
    pub progress: u8,
}

/// Result of asking the manager to cancel a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was pending or running and is now `Canceled`.
    Canceled,
    NotFound,
    /// The task had already finished; its status is left untouched.
    AlreadyTerminal(TaskStatus),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_tags_survive_the_state_cell() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Canceled,
        ] {
            assert_eq!(TaskStatus::from_u8(status.to_u8()), status);
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Canceled.is_terminal());
    }

    #[test]
    fn ids_and_statuses_display_like_the_console_expects() {
        assert_eq!(TaskId(7).to_string(), "DL-7");
        assert_eq!(TaskStatus::InProgress.to_string(), "IN_PROGRESS");
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"IN_PROGRESS\""
        );
    }
}
