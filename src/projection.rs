//! State derived from events.
//!
//! Current status and assignee are pure functions of a task's event
//! sequence. Replaying the same sequence always yields the same projection;
//! nothing here is mutated directly.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::event::{Event, EventType};
use crate::status::TaskStatus;

/// Derived view of one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskProjection {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
}

/// Replays a task's ordered event sequence into its current projection.
///
/// Status comes from the latest `status_changed` event's `new_value`,
/// defaulting to `created` when none exists. A `new_value` that fails to
/// parse as a status is skipped; malformed history must not poison the
/// whole projection.
pub fn project(task_id: &str, events: &[Event]) -> TaskProjection {
    let mut status = TaskStatus::Created;
    let mut assignee = None;

    for event in events {
        match event.event_type {
            EventType::StatusChanged => {
                if let Some(parsed) = event
                    .new_value
                    .as_deref()
                    .and_then(|value| value.parse::<TaskStatus>().ok())
                {
                    status = parsed;
                }
            }
            EventType::Assigned => {
                if event.new_value.is_some() {
                    assignee = event.new_value.clone();
                }
            }
            EventType::Unassigned => assignee = None,
            _ => {}
        }
    }

    TaskProjection {
        task_id: task_id.to_string(),
        status,
        assignee,
    }
}

/// One entry in a task's human-readable timeline.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub description: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

/// Formats an ordered event sequence as a timeline.
pub fn timeline(events: &[Event]) -> Vec<TimelineEntry> {
    events
        .iter()
        .map(|event| TimelineEntry {
            id: event.id.clone(),
            timestamp: event.timestamp,
            event_type: event.event_type,
            user_id: event.actor_id.clone(),
            description: event.describe(),
            metadata: event.metadata.clone(),
        })
        .collect()
}
