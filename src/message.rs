//! Wire envelopes for live subscribers.
//!
//! Outbound envelopes always carry a `type` tag and an RFC 3339 `timestamp`.
//! Inbound client requests are deliberately lenient: unknown `type` values
//! parse to [`ClientRequest::Unknown`] and are ignored by the handler, and a
//! missing `task_id` makes a subscribe/unsubscribe a silent no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::event::Event;

/// Snapshot of the live connection/subscription population.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub total_connections: usize,
    pub unique_users: usize,
    pub total_subscriptions: usize,
    pub tasks_with_subscribers: usize,
}

/// Messages pushed to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    ConnectionEstablished {
        user_id: String,
        client_id: String,
        timestamp: DateTime<Utc>,
    },
    TaskSubscriptionConfirmed {
        task_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_snapshot: Option<Value>,
        timestamp: DateTime<Utc>,
    },
    TaskUpdated {
        update_type: String,
        task_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_snapshot: Option<Value>,
        update_payload: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        latest_event: Option<Event>,
        #[serde(skip_serializing_if = "Option::is_none")]
        actor_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    TaskCreated {
        task_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_snapshot: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        actor_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    TaskDeleted {
        task_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_title: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        actor_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    DependencyUpdated {
        dependent_task_id: String,
        dependency_task_id: String,
        update_type: String,
        update_payload: Value,
        timestamp: DateTime<Utc>,
    },
    MilestoneUpdated {
        milestone_id: String,
        update_type: String,
        related_task_ids: Vec<String>,
        update_payload: Value,
        timestamp: DateTime<Utc>,
    },
    AnalyticsUpdated {
        data: Value,
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    Stats {
        data: ConnectionStats,
        timestamp: DateTime<Utc>,
    },
}

impl OutboundMessage {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Requests a connected client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    SubscribeTask { task_id: Option<String> },
    UnsubscribeTask { task_id: Option<String> },
    Ping,
    GetStats,
    #[serde(other)]
    Unknown,
}

impl ClientRequest {
    /// Parses a raw client frame. Malformed JSON yields `None`; an
    /// unrecognized `type` yields `Some(Unknown)`. Both are ignored upstream.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}
