//! Collaborator interfaces.
//!
//! The core does not own task records, the dependency graph, or user
//! accounts; it consumes them through these traits. The in-memory
//! implementations back tests and small single-process deployments.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::log::EventLog;
use crate::projection::project;
use crate::status::TaskStatus;

/// Full task record as held by the task repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependents: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_hours: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_hours: Option<f64>,
}

impl TaskSnapshot {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            status: TaskStatus::Created,
            priority: None,
            assignee: None,
            due_date: None,
            dependencies: Vec::new(),
            dependents: Vec::new(),
            tags: Vec::new(),
            estimated_hours: None,
            actual_hours: None,
        }
    }
}

/// User record used to enrich outgoing messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub username: String,
    pub email: String,
}

/// Task repository boundary.
pub trait TaskDirectory: Send + Sync {
    fn task_snapshot(&self, task_id: &str) -> Result<Option<TaskSnapshot>>;
}

/// Dependency graph boundary.
pub trait DependencyQuery: Send + Sync {
    /// Tasks that list `task_id` as a dependency.
    fn dependents_of(&self, task_id: &str) -> Result<Vec<String>>;

    /// True when every dependency of the task is completed.
    fn dependencies_resolved(&self, task_id: &str) -> Result<bool>;
}

/// User lookup boundary.
pub trait UserDirectory: Send + Sync {
    fn user(&self, user_id: &str) -> Result<Option<UserProfile>>;
}

/// In-memory task repository.
#[derive(Default)]
pub struct InMemoryTaskDirectory {
    tasks: Mutex<HashMap<String, TaskSnapshot>>,
}

impl InMemoryTaskDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, snapshot: TaskSnapshot) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.insert(snapshot.id.clone(), snapshot);
    }

    pub fn set_status(&self, task_id: &str, status: TaskStatus) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(snapshot) = tasks.get_mut(task_id) {
            snapshot.status = status;
        }
    }

    pub fn remove(&self, task_id: &str) -> Option<TaskSnapshot> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.remove(task_id)
    }
}

impl TaskDirectory for InMemoryTaskDirectory {
    fn task_snapshot(&self, task_id: &str) -> Result<Option<TaskSnapshot>> {
        let tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        Ok(tasks.get(task_id).cloned())
    }
}

/// In-memory dependency graph.
///
/// Edges are declared through [`link`](Self::link); resolution is answered
/// from the event log so the answer always reflects replayed state rather
/// than a second copy of it.
pub struct InMemoryDependencyGraph {
    log: EventLog,
    depends_on: Mutex<HashMap<String, HashSet<String>>>,
}

impl InMemoryDependencyGraph {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            depends_on: Mutex::new(HashMap::new()),
        }
    }

    /// Declares that `task_id` depends on `dependency_id`.
    pub fn link(&self, task_id: &str, dependency_id: &str) {
        let mut edges = self.depends_on.lock().unwrap_or_else(|p| p.into_inner());
        edges
            .entry(task_id.to_string())
            .or_default()
            .insert(dependency_id.to_string());
    }

    pub fn unlink(&self, task_id: &str, dependency_id: &str) {
        let mut edges = self.depends_on.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(deps) = edges.get_mut(task_id) {
            deps.remove(dependency_id);
            if deps.is_empty() {
                edges.remove(task_id);
            }
        }
    }

    pub fn dependencies_of(&self, task_id: &str) -> Vec<String> {
        let edges = self.depends_on.lock().unwrap_or_else(|p| p.into_inner());
        edges
            .get(task_id)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl DependencyQuery for InMemoryDependencyGraph {
    fn dependents_of(&self, task_id: &str) -> Result<Vec<String>> {
        let edges = self.depends_on.lock().unwrap_or_else(|p| p.into_inner());
        let mut dependents: Vec<String> = edges
            .iter()
            .filter(|(_, deps)| deps.contains(task_id))
            .map(|(dependent, _)| dependent.clone())
            .collect();
        dependents.sort();
        Ok(dependents)
    }

    fn dependencies_resolved(&self, task_id: &str) -> Result<bool> {
        let deps = self.dependencies_of(task_id);
        for dependency_id in deps {
            let events = self.log.events(&dependency_id)?;
            let projection = project(&dependency_id, &events);
            if projection.status != TaskStatus::Completed {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// In-memory user lookup.
#[derive(Default)]
pub struct InMemoryUserDirectory {
    users: Mutex<HashMap<String, UserProfile>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, profile: UserProfile) {
        let mut users = self.users.lock().unwrap_or_else(|p| p.into_inner());
        users.insert(profile.id.clone(), profile);
    }
}

impl UserDirectory for InMemoryUserDirectory {
    fn user(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let users = self.users.lock().unwrap_or_else(|p| p.into_inner());
        Ok(users.get(user_id).cloned())
    }
}
