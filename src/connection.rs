//! Live connection tracking.
//!
//! Each connection is a `(user_id, client_id)` pair owning one outbound
//! channel; the consuming side of the channel is the transport task that
//! writes frames to the actual socket. Delivery is best-effort: a send that
//! times out or hits a closed channel deregisters that connection and moves
//! on, so one dead consumer never stalls fan-out to the rest.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::BroadcastConfig;
use crate::message::OutboundMessage;
use crate::registry::SubscriptionRegistry;

/// Composite key for one live connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub user_id: String,
    pub client_id: String,
}

impl ConnectionKey {
    pub fn new(user_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            client_id: client_id.into(),
        }
    }
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.user_id, self.client_id)
    }
}

/// Outbound half of a connection: serialized frames flow through here to
/// the transport task.
pub type Transport = mpsc::Sender<String>;

/// Owns all live transports and the connect/disconnect lifecycle.
pub struct ConnectionManager {
    connections: Mutex<HashMap<ConnectionKey, Transport>>,
    registry: Arc<SubscriptionRegistry>,
    channel_capacity: usize,
    send_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(registry: Arc<SubscriptionRegistry>, config: &BroadcastConfig) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            registry,
            channel_capacity: config.channel_capacity,
            send_timeout: config.send_timeout(),
        }
    }

    /// Builds the outbound channel at the configured capacity, registers the
    /// connection, and returns the receiving half for the transport task to
    /// pump to the socket.
    pub async fn open_connection(&self, user_id: &str, client_id: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        self.connect(user_id, client_id, tx).await;
        rx
    }

    /// Registers a transport and confirms the connection to the client.
    pub async fn connect(&self, user_id: &str, client_id: &str, transport: Transport) {
        let key = ConnectionKey::new(user_id, client_id);
        {
            let mut connections = self.connections.lock().await;
            connections.insert(key.clone(), transport);
        }
        info!(connection = %key, "connection established");

        let confirmation = OutboundMessage::ConnectionEstablished {
            user_id: user_id.to_string(),
            client_id: client_id.to_string(),
            timestamp: Utc::now(),
        };
        self.send_to_connection(&key, &confirmation).await;
    }

    /// Removes a transport. The user's subscriptions survive as long as any
    /// sibling connection remains; the last disconnect drops them all.
    pub async fn disconnect(&self, user_id: &str, client_id: &str) {
        let key = ConnectionKey::new(user_id, client_id);
        let last_for_user = {
            let mut connections = self.connections.lock().await;
            connections.remove(&key);
            !connections.keys().any(|other| other.user_id == user_id)
        };
        if last_for_user {
            self.registry.drop_user(user_id);
        }
        info!(connection = %key, last_for_user, "connection closed");
    }

    /// Delivers a message to every live connection of a user. Returns the
    /// number of successful deliveries; failures are logged and the failing
    /// connections deregistered.
    pub async fn send_to_user(&self, user_id: &str, message: &OutboundMessage) -> usize {
        let targets: Vec<(ConnectionKey, Transport)> = {
            let connections = self.connections.lock().await;
            connections
                .iter()
                .filter(|(key, _)| key.user_id == user_id)
                .map(|(key, transport)| (key.clone(), transport.clone()))
                .collect()
        };
        self.deliver(targets, message).await
    }

    /// Delivers a message to one specific connection.
    pub async fn send_to_connection(&self, key: &ConnectionKey, message: &OutboundMessage) -> bool {
        let transport = {
            let connections = self.connections.lock().await;
            connections.get(key).cloned()
        };
        let Some(transport) = transport else {
            return false;
        };
        self.deliver(vec![(key.clone(), transport)], message).await == 1
    }

    /// Delivers a message to every live connection.
    pub async fn broadcast_all(&self, message: &OutboundMessage) -> usize {
        let targets: Vec<(ConnectionKey, Transport)> = {
            let connections = self.connections.lock().await;
            connections
                .iter()
                .map(|(key, transport)| (key.clone(), transport.clone()))
                .collect()
        };
        self.deliver(targets, message).await
    }

    async fn deliver(
        &self,
        targets: Vec<(ConnectionKey, Transport)>,
        message: &OutboundMessage,
    ) -> usize {
        let frame = match message.to_json() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "failed to serialize outbound message");
                return 0;
            }
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (key, transport) in targets {
            match transport
                .send_timeout(frame.clone(), self.send_timeout)
                .await
            {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(connection = %key, error = %err, "send failed, dropping connection");
                    failed.push(key);
                }
            }
        }
        for key in failed {
            self.remove_failed(key).await;
        }
        delivered
    }

    async fn remove_failed(&self, key: ConnectionKey) {
        let last_for_user = {
            let mut connections = self.connections.lock().await;
            if connections.remove(&key).is_none() {
                // Another delivery already removed it.
                return;
            }
            !connections
                .keys()
                .any(|other| other.user_id == key.user_id)
        };
        if last_for_user {
            self.registry.drop_user(&key.user_id);
            debug!(user_id = %key.user_id, "dropped subscriptions for unreachable user");
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn unique_user_count(&self) -> usize {
        let connections = self.connections.lock().await;
        let mut users: Vec<&str> = connections.keys().map(|key| key.user_id.as_str()).collect();
        users.sort_unstable();
        users.dedup();
        users.len()
    }

    pub async fn is_connected(&self, user_id: &str) -> bool {
        let connections = self.connections.lock().await;
        connections.keys().any(|key| key.user_id == user_id)
    }
}
