//! Update fan-out to live subscribers.
//!
//! The broadcaster composes envelopes from the refreshed projection, the
//! latest event, and collaborator lookups, then pushes them through the
//! connection manager to every subscriber of the affected task. Updates
//! cascade: subscribers of tasks that depend on the changed task receive a
//! `dependency_updated` notice.
//!
//! Everything here is best-effort. A collaborator that cannot be reached
//! degrades the envelope instead of failing the publish, and delivery
//! failures never surface to the publishing caller.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use crate::connection::{ConnectionKey, ConnectionManager, Transport};
use crate::directory::{DependencyQuery, TaskDirectory, UserDirectory};
use crate::log::EventLog;
use crate::message::{ClientRequest, ConnectionStats, OutboundMessage};
use crate::registry::SubscriptionRegistry;

/// Composes and fans out update messages.
pub struct Broadcaster {
    log: EventLog,
    registry: Arc<SubscriptionRegistry>,
    connections: Arc<ConnectionManager>,
    tasks: Arc<dyn TaskDirectory>,
    dependencies: Arc<dyn DependencyQuery>,
    users: Arc<dyn UserDirectory>,
}

impl Broadcaster {
    pub fn new(
        log: EventLog,
        registry: Arc<SubscriptionRegistry>,
        connections: Arc<ConnectionManager>,
        tasks: Arc<dyn TaskDirectory>,
        dependencies: Arc<dyn DependencyQuery>,
        users: Arc<dyn UserDirectory>,
    ) -> Self {
        Self {
            log,
            registry,
            connections,
            tasks,
            dependencies,
            users,
        }
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Task snapshot as a JSON object with the assignee expanded to a user
    /// profile when the user directory knows them. Lookup failures degrade
    /// to the unenriched form.
    fn enriched_snapshot(&self, task_id: &str) -> Option<Value> {
        let snapshot = match self.tasks.task_snapshot(task_id) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return None,
            Err(err) => {
                warn!(task_id, error = %err, "task repository unavailable, skipping enrichment");
                return None;
            }
        };
        let assignee = snapshot.assignee.clone();
        let mut value = match serde_json::to_value(&snapshot) {
            Ok(value) => value,
            Err(err) => {
                warn!(task_id, error = %err, "snapshot serialization failed");
                return None;
            }
        };
        if let Some(assignee_id) = assignee {
            match self.users.user(&assignee_id) {
                Ok(Some(profile)) => {
                    value["assignee"] = serde_json::json!({
                        "id": profile.id,
                        "username": profile.username,
                        "email": profile.email,
                    });
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(user_id = %assignee_id, error = %err, "user lookup failed during enrichment");
                }
            }
        }
        Some(value)
    }

    /// Publishes a task update to its subscribers and cascades a
    /// `dependency_updated` notice to subscribers of dependent tasks.
    pub async fn publish(
        &self,
        task_id: &str,
        update_type: &str,
        update_payload: Value,
        actor_id: Option<&str>,
    ) {
        let subscribers = self.registry.subscribers_of(task_id);
        if !subscribers.is_empty() {
            let latest_event = match self.log.latest_event(task_id) {
                Ok(latest) => latest,
                Err(err) => {
                    warn!(task_id, error = %err, "event log read failed during publish");
                    None
                }
            };
            let message = OutboundMessage::TaskUpdated {
                update_type: update_type.to_string(),
                task_id: task_id.to_string(),
                task_snapshot: self.enriched_snapshot(task_id),
                update_payload: update_payload.clone(),
                latest_event,
                actor_id: actor_id.map(str::to_string),
                timestamp: Utc::now(),
            };
            self.fan_out(&subscribers, &message).await;
        }

        self.cascade_to_dependents(task_id, update_type, update_payload)
            .await;
    }

    async fn cascade_to_dependents(&self, task_id: &str, update_type: &str, update_payload: Value) {
        let dependents = match self.dependencies.dependents_of(task_id) {
            Ok(dependents) => dependents,
            Err(err) => {
                warn!(task_id, error = %err, "dependency lookup failed, skipping cascade");
                return;
            }
        };
        for dependent_task_id in dependents {
            let subscribers = self.registry.subscribers_of(&dependent_task_id);
            if subscribers.is_empty() {
                continue;
            }
            let message = OutboundMessage::DependencyUpdated {
                dependent_task_id: dependent_task_id.clone(),
                dependency_task_id: task_id.to_string(),
                update_type: update_type.to_string(),
                update_payload: update_payload.clone(),
                timestamp: Utc::now(),
            };
            self.fan_out(&subscribers, &message).await;
        }
    }

    /// Announces a new task to every connected user.
    pub async fn publish_task_created(&self, task_id: &str, actor_id: Option<&str>) {
        let message = OutboundMessage::TaskCreated {
            task_id: task_id.to_string(),
            task_snapshot: self.enriched_snapshot(task_id),
            actor_id: actor_id.map(str::to_string),
            timestamp: Utc::now(),
        };
        let delivered = self.connections.broadcast_all(&message).await;
        debug!(task_id, delivered, "task creation broadcast");
    }

    /// Announces a deletion to current subscribers, then force-unsubscribes
    /// all of them from the task.
    pub async fn publish_task_deleted(&self, task_id: &str, actor_id: Option<&str>) {
        let task_title = self
            .enriched_snapshot(task_id)
            .and_then(|snapshot| snapshot["title"].as_str().map(str::to_string));
        let subscribers = self.registry.subscribers_of(task_id);
        if !subscribers.is_empty() {
            let message = OutboundMessage::TaskDeleted {
                task_id: task_id.to_string(),
                task_title,
                actor_id: actor_id.map(str::to_string),
                timestamp: Utc::now(),
            };
            self.fan_out(&subscribers, &message).await;
        }
        self.registry.drop_task(task_id);
    }

    /// Notifies subscribers of every related task about a milestone change.
    pub async fn publish_milestone_update(
        &self,
        milestone_id: &str,
        update_type: &str,
        related_task_ids: &[String],
        update_payload: Value,
    ) {
        let mut audience = HashSet::new();
        for task_id in related_task_ids {
            audience.extend(self.registry.subscribers_of(task_id));
        }
        if audience.is_empty() {
            return;
        }
        let message = OutboundMessage::MilestoneUpdated {
            milestone_id: milestone_id.to_string(),
            update_type: update_type.to_string(),
            related_task_ids: related_task_ids.to_vec(),
            update_payload,
            timestamp: Utc::now(),
        };
        self.fan_out(&audience, &message).await;
    }

    /// Sends an analytics refresh to one user.
    pub async fn send_analytics_update(&self, user_id: &str, data: Value) {
        let message = OutboundMessage::AnalyticsUpdated {
            data,
            timestamp: Utc::now(),
        };
        self.connections.send_to_user(user_id, &message).await;
    }

    async fn fan_out(&self, subscribers: &HashSet<String>, message: &OutboundMessage) {
        let mut ordered: Vec<&String> = subscribers.iter().collect();
        ordered.sort();
        for user_id in ordered {
            self.connections.send_to_user(user_id, message).await;
        }
    }

    /// Opens a connection with a channel sized from configuration.
    /// Convenience pass-through so callers hold one handle for the whole
    /// subscriber-facing surface.
    pub async fn open_connection(
        &self,
        user_id: &str,
        client_id: &str,
    ) -> tokio::sync::mpsc::Receiver<String> {
        self.connections.open_connection(user_id, client_id).await
    }

    /// Registers a caller-built transport.
    pub async fn connect(&self, user_id: &str, client_id: &str, transport: Transport) {
        self.connections.connect(user_id, client_id, transport).await;
    }

    pub async fn disconnect(&self, user_id: &str, client_id: &str) {
        self.connections.disconnect(user_id, client_id).await;
    }

    /// Handles one inbound client frame. Malformed frames, unknown request
    /// types, and subscribe/unsubscribe without a task id are ignored.
    pub async fn handle_client_request(&self, user_id: &str, client_id: &str, raw: &str) {
        let Some(request) = ClientRequest::parse(raw) else {
            debug!(user_id, "ignoring malformed client frame");
            return;
        };
        match request {
            ClientRequest::SubscribeTask { task_id: Some(task_id) } => {
                self.registry.subscribe(user_id, &task_id);
                let message = OutboundMessage::TaskSubscriptionConfirmed {
                    task_id: task_id.clone(),
                    task_snapshot: self.enriched_snapshot(&task_id),
                    timestamp: Utc::now(),
                };
                self.connections.send_to_user(user_id, &message).await;
            }
            ClientRequest::UnsubscribeTask { task_id: Some(task_id) } => {
                self.registry.unsubscribe(user_id, &task_id);
            }
            ClientRequest::Ping => {
                let key = ConnectionKey::new(user_id, client_id);
                let message = OutboundMessage::Pong {
                    timestamp: Utc::now(),
                };
                self.connections.send_to_connection(&key, &message).await;
            }
            ClientRequest::GetStats => {
                let key = ConnectionKey::new(user_id, client_id);
                let message = OutboundMessage::Stats {
                    data: self.stats().await,
                    timestamp: Utc::now(),
                };
                self.connections.send_to_connection(&key, &message).await;
            }
            ClientRequest::SubscribeTask { task_id: None }
            | ClientRequest::UnsubscribeTask { task_id: None } => {
                debug!(user_id, "ignoring subscribe/unsubscribe without task_id");
            }
            ClientRequest::Unknown => {
                debug!(user_id, "ignoring unknown client request type");
            }
        }
    }

    pub async fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            total_connections: self.connections.connection_count().await,
            unique_users: self.connections.unique_user_count().await,
            total_subscriptions: self.registry.subscription_count(),
            tasks_with_subscribers: self.registry.task_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BroadcastConfig;
    use crate::directory::{
        InMemoryDependencyGraph, InMemoryTaskDirectory, InMemoryUserDirectory, TaskSnapshot,
        UserProfile,
    };
    use crate::event::{Event, EventType};
    use tokio::sync::mpsc;

    struct Harness {
        broadcaster: Broadcaster,
        log: EventLog,
        tasks: Arc<InMemoryTaskDirectory>,
        graph: Arc<InMemoryDependencyGraph>,
        users: Arc<InMemoryUserDirectory>,
    }

    fn harness() -> Harness {
        let log = EventLog::in_memory();
        let registry = Arc::new(SubscriptionRegistry::new());
        let connections = Arc::new(ConnectionManager::new(
            Arc::clone(&registry),
            &BroadcastConfig::default(),
        ));
        let tasks = Arc::new(InMemoryTaskDirectory::new());
        let graph = Arc::new(InMemoryDependencyGraph::new(log.clone()));
        let users = Arc::new(InMemoryUserDirectory::new());
        let broadcaster = Broadcaster::new(
            log.clone(),
            registry,
            connections,
            Arc::clone(&tasks) as Arc<dyn TaskDirectory>,
            Arc::clone(&graph) as Arc<dyn DependencyQuery>,
            Arc::clone(&users) as Arc<dyn UserDirectory>,
        );
        Harness {
            broadcaster,
            log,
            tasks,
            graph,
            users,
        }
    }

    async fn connected(
        harness: &Harness,
        user_id: &str,
        client_id: &str,
    ) -> mpsc::Receiver<String> {
        let mut rx = harness.broadcaster.open_connection(user_id, client_id).await;
        let frame = rx.recv().await.expect("connection_established");
        let json: Value = serde_json::from_str(&frame).expect("json");
        assert_eq!(json["type"], "connection_established");
        rx
    }

    async fn next_json(rx: &mut mpsc::Receiver<String>) -> Value {
        let frame = rx.recv().await.expect("frame");
        serde_json::from_str(&frame).expect("json")
    }

    #[tokio::test]
    async fn publish_reaches_subscribers_with_snapshot_and_event() {
        let harness = harness();
        let mut rx = connected(&harness, "alice", "web").await;
        harness.broadcaster.registry().subscribe("alice", "task-1");

        let mut snapshot = TaskSnapshot::new("task-1", "Ship it");
        snapshot.assignee = Some("bob".to_string());
        harness.tasks.insert(snapshot);
        harness.users.insert(UserProfile {
            id: "bob".to_string(),
            username: "bob".to_string(),
            email: "bob@example.com".to_string(),
        });
        harness
            .log
            .append(Event::new(EventType::Created, "task-1"))
            .expect("append");

        harness
            .broadcaster
            .publish(
                "task-1",
                "status_changed",
                serde_json::json!({"new_status": "in_progress"}),
                Some("carol"),
            )
            .await;

        let json = next_json(&mut rx).await;
        assert_eq!(json["type"], "task_updated");
        assert_eq!(json["update_type"], "status_changed");
        assert_eq!(json["task_id"], "task-1");
        assert_eq!(json["task_snapshot"]["title"], "Ship it");
        assert_eq!(json["task_snapshot"]["assignee"]["email"], "bob@example.com");
        assert_eq!(json["latest_event"]["type"], "created");
        assert_eq!(json["actor_id"], "carol");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let harness = harness();
        let mut rx = connected(&harness, "alice", "web").await;

        harness
            .broadcaster
            .publish("task-1", "status_changed", Value::Null, None)
            .await;

        // Nothing for alice: she never subscribed.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cascade_notifies_dependent_subscribers() {
        let harness = harness();
        let mut rx = connected(&harness, "dana", "web").await;
        // Dana watches task-2, which depends on task-1.
        harness.broadcaster.registry().subscribe("dana", "task-2");
        harness.graph.link("task-2", "task-1");

        harness
            .broadcaster
            .publish(
                "task-1",
                "completed",
                serde_json::json!({"new_status": "completed"}),
                None,
            )
            .await;

        let json = next_json(&mut rx).await;
        assert_eq!(json["type"], "dependency_updated");
        assert_eq!(json["dependent_task_id"], "task-2");
        assert_eq!(json["dependency_task_id"], "task-1");
        assert_eq!(json["update_type"], "completed");
    }

    #[tokio::test]
    async fn broken_subscriber_does_not_block_the_rest() {
        let harness = harness();
        let mut rx_a = connected(&harness, "alice", "web").await;
        let rx_b = connected(&harness, "bob", "web").await;
        let mut rx_c = connected(&harness, "carol", "web").await;
        for user in ["alice", "bob", "carol"] {
            harness.broadcaster.registry().subscribe(user, "task-1");
        }
        drop(rx_b);

        harness
            .broadcaster
            .publish("task-1", "comment_added", Value::Null, None)
            .await;

        assert_eq!(next_json(&mut rx_a).await["type"], "task_updated");
        assert_eq!(next_json(&mut rx_c).await["type"], "task_updated");
        // Bob's dead connection was deregistered and his subscription dropped.
        assert_eq!(harness.broadcaster.connections().connection_count().await, 2);
        assert!(harness.broadcaster.registry().tasks_of("bob").is_empty());
    }

    #[tokio::test]
    async fn task_created_reaches_all_connected_users() {
        let harness = harness();
        let mut rx_a = connected(&harness, "alice", "web").await;
        let mut rx_b = connected(&harness, "bob", "web").await;

        harness
            .broadcaster
            .publish_task_created("task-9", Some("alice"))
            .await;

        assert_eq!(next_json(&mut rx_a).await["type"], "task_created");
        let json = next_json(&mut rx_b).await;
        assert_eq!(json["type"], "task_created");
        assert_eq!(json["task_id"], "task-9");
    }

    #[tokio::test]
    async fn task_deleted_notifies_then_unsubscribes() {
        let harness = harness();
        let mut rx = connected(&harness, "alice", "web").await;
        harness.broadcaster.registry().subscribe("alice", "task-1");
        harness.tasks.insert(TaskSnapshot::new("task-1", "Doomed"));

        harness
            .broadcaster
            .publish_task_deleted("task-1", Some("admin"))
            .await;

        let json = next_json(&mut rx).await;
        assert_eq!(json["type"], "task_deleted");
        assert_eq!(json["task_title"], "Doomed");
        assert!(harness.broadcaster.registry().subscribers_of("task-1").is_empty());
        assert!(harness.broadcaster.registry().tasks_of("alice").is_empty());
    }

    #[tokio::test]
    async fn milestone_update_reaches_union_of_subscribers_once() {
        let harness = harness();
        let mut rx = connected(&harness, "alice", "web").await;
        harness.broadcaster.registry().subscribe("alice", "task-1");
        harness.broadcaster.registry().subscribe("alice", "task-2");

        harness
            .broadcaster
            .publish_milestone_update(
                "milestone-1",
                "completed",
                &["task-1".to_string(), "task-2".to_string()],
                Value::Null,
            )
            .await;

        let json = next_json(&mut rx).await;
        assert_eq!(json["type"], "milestone_updated");
        assert_eq!(json["milestone_id"], "milestone-1");
        // Subscribed to both related tasks, but only one message arrives.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscribe_request_confirms_with_snapshot() {
        let harness = harness();
        let mut rx = connected(&harness, "alice", "web").await;
        harness.tasks.insert(TaskSnapshot::new("task-1", "Watch me"));

        harness
            .broadcaster
            .handle_client_request("alice", "web", r#"{"type":"subscribe_task","task_id":"task-1"}"#)
            .await;

        let json = next_json(&mut rx).await;
        assert_eq!(json["type"], "task_subscription_confirmed");
        assert_eq!(json["task_snapshot"]["title"], "Watch me");
        assert!(harness
            .broadcaster
            .registry()
            .subscribers_of("task-1")
            .contains("alice"));
    }

    #[tokio::test]
    async fn ping_answers_pong_on_same_connection() {
        let harness = harness();
        let mut rx_web = connected(&harness, "alice", "web").await;
        let mut rx_mobile = connected(&harness, "alice", "mobile").await;

        harness
            .broadcaster
            .handle_client_request("alice", "web", r#"{"type":"ping"}"#)
            .await;

        assert_eq!(next_json(&mut rx_web).await["type"], "pong");
        assert!(rx_mobile.try_recv().is_err());
    }

    #[tokio::test]
    async fn stats_request_reports_population() {
        let harness = harness();
        let mut rx = connected(&harness, "alice", "web").await;
        harness.broadcaster.registry().subscribe("alice", "task-1");

        harness
            .broadcaster
            .handle_client_request("alice", "web", r#"{"type":"get_stats"}"#)
            .await;

        let json = next_json(&mut rx).await;
        assert_eq!(json["type"], "stats");
        assert_eq!(json["data"]["total_connections"], 1);
        assert_eq!(json["data"]["unique_users"], 1);
        assert_eq!(json["data"]["total_subscriptions"], 1);
        assert_eq!(json["data"]["tasks_with_subscribers"], 1);
    }

    #[tokio::test]
    async fn malformed_and_unknown_requests_are_ignored() {
        let harness = harness();
        let mut rx = connected(&harness, "alice", "web").await;

        harness
            .broadcaster
            .handle_client_request("alice", "web", "{broken")
            .await;
        harness
            .broadcaster
            .handle_client_request("alice", "web", r#"{"type":"subscribe_task"}"#)
            .await;
        harness
            .broadcaster
            .handle_client_request("alice", "web", r#"{"type":"warp_drive"}"#)
            .await;

        assert!(rx.try_recv().is_err());
        assert_eq!(harness.broadcaster.registry().subscription_count(), 0);
    }
}
