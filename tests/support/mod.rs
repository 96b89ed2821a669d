//! Shared fixture wiring the full stack in memory.
#![allow(dead_code)]

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use taskpulse::broadcast::Broadcaster;
use taskpulse::config::Config;
use taskpulse::connection::ConnectionManager;
use taskpulse::directory::{
    DependencyQuery, InMemoryDependencyGraph, InMemoryTaskDirectory, InMemoryUserDirectory,
    TaskDirectory, UserDirectory,
};
use taskpulse::log::EventLog;
use taskpulse::registry::SubscriptionRegistry;
use taskpulse::tracker::LifecycleTracker;

/// Opt-in tracing for debugging a failing test: `RUST_LOG=taskpulse=debug`.
fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub struct TestStack {
    pub tracker: LifecycleTracker,
    pub tasks: Arc<InMemoryTaskDirectory>,
    pub graph: Arc<InMemoryDependencyGraph>,
    pub users: Arc<InMemoryUserDirectory>,
}

impl TestStack {
    pub fn new() -> Self {
        init_tracing();
        let config = Config::default();
        let log = EventLog::in_memory();
        let registry = Arc::new(SubscriptionRegistry::new());
        let connections = Arc::new(ConnectionManager::new(
            Arc::clone(&registry),
            &config.broadcast,
        ));
        let tasks = Arc::new(InMemoryTaskDirectory::new());
        let graph = Arc::new(InMemoryDependencyGraph::new(log.clone()));
        let users = Arc::new(InMemoryUserDirectory::new());
        let broadcaster = Arc::new(Broadcaster::new(
            log.clone(),
            registry,
            connections,
            Arc::clone(&tasks) as Arc<dyn TaskDirectory>,
            Arc::clone(&graph) as Arc<dyn DependencyQuery>,
            Arc::clone(&users) as Arc<dyn UserDirectory>,
        ));
        let tracker = LifecycleTracker::new(
            log,
            broadcaster,
            Arc::clone(&graph) as Arc<dyn DependencyQuery>,
            &config,
        );
        Self {
            tracker,
            tasks,
            graph,
            users,
        }
    }

    /// Connects a client and consumes the connection confirmation frame.
    pub async fn connect(&self, user_id: &str, client_id: &str) -> mpsc::Receiver<String> {
        let mut rx = self
            .tracker
            .broadcaster()
            .open_connection(user_id, client_id)
            .await;
        let frame = rx.recv().await.expect("connection_established frame");
        let json: Value = serde_json::from_str(&frame).expect("json frame");
        assert_eq!(json["type"], "connection_established");
        rx
    }

    pub fn subscribe(&self, user_id: &str, task_id: &str) {
        self.tracker.broadcaster().registry().subscribe(user_id, task_id);
    }
}

pub async fn next_json(rx: &mut mpsc::Receiver<String>) -> Value {
    let frame = rx.recv().await.expect("frame");
    serde_json::from_str(&frame).expect("json frame")
}
