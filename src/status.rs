//! Task status state machine.
//!
//! Statuses form a closed set; the transition table below is the single
//! authority on which status changes are legal. `completed` and `cancelled`
//! are terminal. Unknown status strings are rejected at parse time, not at
//! use time.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Current lifecycle status of a task, derived by replaying its events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Assigned,
    InProgress,
    Blocked,
    Review,
    Completed,
    Cancelled,
}

impl TaskStatus {
    /// All statuses, in lifecycle order. Used for zero-filled metric buckets
    /// and status distributions.
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Created,
        TaskStatus::Assigned,
        TaskStatus::InProgress,
        TaskStatus::Blocked,
        TaskStatus::Review,
        TaskStatus::Completed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Review => "review",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Statuses reachable from `self` in one legal transition.
    pub fn allowed_transitions(&self) -> &'static [TaskStatus] {
        match self {
            TaskStatus::Created => &[
                TaskStatus::Assigned,
                TaskStatus::InProgress,
                TaskStatus::Cancelled,
            ],
            TaskStatus::Assigned => &[TaskStatus::InProgress, TaskStatus::Cancelled],
            TaskStatus::InProgress => &[
                TaskStatus::Blocked,
                TaskStatus::Review,
                TaskStatus::Completed,
                TaskStatus::Cancelled,
            ],
            TaskStatus::Blocked => &[TaskStatus::InProgress, TaskStatus::Cancelled],
            TaskStatus::Review => &[
                TaskStatus::InProgress,
                TaskStatus::Completed,
                TaskStatus::Cancelled,
            ],
            TaskStatus::Completed | TaskStatus::Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        self.allowed_transitions().contains(&to)
    }

    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "created" => Ok(TaskStatus::Created),
            "assigned" => Ok(TaskStatus::Assigned),
            "in_progress" => Ok(TaskStatus::InProgress),
            "blocked" => Ok(TaskStatus::Blocked),
            "review" => Ok(TaskStatus::Review),
            "completed" => Ok(TaskStatus::Completed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(Error::UnknownStatus(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_matches_design() {
        use TaskStatus::*;

        let legal = [
            (Created, Assigned),
            (Created, InProgress),
            (Created, Cancelled),
            (Assigned, InProgress),
            (Assigned, Cancelled),
            (InProgress, Blocked),
            (InProgress, Review),
            (InProgress, Completed),
            (InProgress, Cancelled),
            (Blocked, InProgress),
            (Blocked, Cancelled),
            (Review, InProgress),
            (Review, Completed),
            (Review, Cancelled),
        ];

        for from in TaskStatus::ALL {
            for to in TaskStatus::ALL {
                let expected = legal.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "{from} -> {to} should be {expected}"
                );
            }
        }
    }

    #[test]
    fn terminal_statuses_have_no_exits() {
        assert!(TaskStatus::Completed.allowed_transitions().is_empty());
        assert!(TaskStatus::Cancelled.allowed_transitions().is_empty());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Blocked.is_terminal());
    }

    #[test]
    fn parse_round_trips() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
    }

    #[test]
    fn parse_rejects_unknown_values() {
        assert!("done".parse::<TaskStatus>().is_err());
        assert!("".parse::<TaskStatus>().is_err());
        assert!("IN_PROGRESS".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let back: TaskStatus = serde_json::from_str("\"blocked\"").unwrap();
        assert_eq!(back, TaskStatus::Blocked);
    }
}
