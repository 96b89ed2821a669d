//! Error types for taskpulse
//!
//! Lifecycle actions distinguish three rejection classes:
//! - `NotFound`: the task has no recorded events
//! - `InvalidTransition`: the requested status change is not in the table
//! - `DependencyUnresolved`: a `start` was attempted before every dependency
//!   completed
//!
//! All three reject without appending an event and without broadcasting.

use thiserror::Error;

use crate::status::TaskStatus;

/// Main error type for taskpulse operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Unresolved dependencies for task: {0}")]
    DependencyUnresolved(String),

    #[error("Unknown status: {0}")]
    UnknownStatus(String),

    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

/// Result type alias using [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_task_id() {
        let err = Error::NotFound("task-42".to_string());
        assert_eq!(err.to_string(), "Task not found: task-42");
    }

    #[test]
    fn display_names_both_statuses() {
        let err = Error::InvalidTransition {
            from: TaskStatus::Created,
            to: TaskStatus::Completed,
        };
        assert_eq!(err.to_string(), "Invalid transition: created -> completed");
    }
}
