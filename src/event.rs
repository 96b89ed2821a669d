//! Lifecycle events.
//!
//! Events are immutable, append-only, and form the single source of truth
//! for task state and metrics. They are never mutated or deleted after
//! recording.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::error::Error;

/// Kinds of lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    StatusChanged,
    Assigned,
    Unassigned,
    PriorityChanged,
    DueDateChanged,
    CommentAdded,
    AttachmentAdded,
    DependencyAdded,
    DependencyRemoved,
    Completed,
    Cancelled,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "created",
            EventType::StatusChanged => "status_changed",
            EventType::Assigned => "assigned",
            EventType::Unassigned => "unassigned",
            EventType::PriorityChanged => "priority_changed",
            EventType::DueDateChanged => "due_date_changed",
            EventType::CommentAdded => "comment_added",
            EventType::AttachmentAdded => "attachment_added",
            EventType::DependencyAdded => "dependency_added",
            EventType::DependencyRemoved => "dependency_removed",
            EventType::Completed => "completed",
            EventType::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "created" => Ok(EventType::Created),
            "status_changed" => Ok(EventType::StatusChanged),
            "assigned" => Ok(EventType::Assigned),
            "unassigned" => Ok(EventType::Unassigned),
            "priority_changed" => Ok(EventType::PriorityChanged),
            "due_date_changed" => Ok(EventType::DueDateChanged),
            "comment_added" => Ok(EventType::CommentAdded),
            "attachment_added" => Ok(EventType::AttachmentAdded),
            "dependency_added" => Ok(EventType::DependencyAdded),
            "dependency_removed" => Ok(EventType::DependencyRemoved),
            "completed" => Ok(EventType::Completed),
            "cancelled" => Ok(EventType::Cancelled),
            other => Err(Error::UnknownEventType(other.to_string())),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded lifecycle occurrence for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub task_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_value: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl Event {
    pub fn new(event_type: EventType, task_id: impl Into<String>) -> Self {
        Self {
            id: Ulid::new().to_string(),
            task_id: task_id.into(),
            event_type,
            timestamp: Utc::now(),
            actor_id: None,
            old_value: None,
            new_value: None,
            metadata: HashMap::new(),
        }
    }

    /// Human-readable description for timelines and activity feeds.
    pub fn describe(&self) -> String {
        let old = self.old_value.as_deref().unwrap_or("none");
        let new = self.new_value.as_deref().unwrap_or("none");
        match self.event_type {
            EventType::Created => "Task was created".to_string(),
            EventType::StatusChanged => format!("Status changed from {old} to {new}"),
            EventType::Assigned => format!("Task assigned to user {new}"),
            EventType::Unassigned => "Task was unassigned".to_string(),
            EventType::PriorityChanged => format!("Priority changed from {old} to {new}"),
            EventType::DueDateChanged => format!("Due date changed from {old} to {new}"),
            EventType::CommentAdded => "Comment was added".to_string(),
            EventType::AttachmentAdded => "Attachment was added".to_string(),
            EventType::DependencyAdded => format!("Dependency added: {new}"),
            EventType::DependencyRemoved => format!("Dependency removed: {old}"),
            EventType::Completed => "Task was completed".to_string(),
            EventType::Cancelled => "Task was cancelled".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_assigns_unique_ids() {
        let first = Event::new(EventType::Created, "task-1");
        let second = Event::new(EventType::Created, "task-1");
        assert_ne!(first.id, second.id);
        assert_eq!(first.task_id, "task-1");
        assert!(first.metadata.is_empty());
    }

    #[test]
    fn serializes_type_field_and_skips_empty_options() {
        let event = Event::new(EventType::CommentAdded, "task-1");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "comment_added");
        assert!(json.get("actor_id").is_none());
        assert!(json.get("old_value").is_none());
        assert!(json.get("metadata").is_none());
    }

    #[test]
    fn describe_interpolates_values() {
        let mut event = Event::new(EventType::StatusChanged, "task-1");
        event.old_value = Some("created".to_string());
        event.new_value = Some("in_progress".to_string());
        assert_eq!(event.describe(), "Status changed from created to in_progress");

        let mut dep = Event::new(EventType::DependencyAdded, "task-1");
        dep.new_value = Some("task-2".to_string());
        assert_eq!(dep.describe(), "Dependency added: task-2");
    }

    #[test]
    fn event_type_parse_round_trips() {
        for raw in [
            "created",
            "status_changed",
            "assigned",
            "unassigned",
            "priority_changed",
            "due_date_changed",
            "comment_added",
            "attachment_added",
            "dependency_added",
            "dependency_removed",
            "completed",
            "cancelled",
        ] {
            let parsed: EventType = raw.parse().unwrap();
            assert_eq!(parsed.as_str(), raw);
        }
        assert!("renamed".parse::<EventType>().is_err());
    }
}
