//! Subscription registry.
//!
//! Bidirectional index of which users want updates for which tasks. Both
//! directions are mutated under one mutex per operation, so readers always
//! observe a consistent pairing: a user is in a task's subscriber set iff
//! the task is in the user's subscription set.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Default)]
struct Indices {
    tasks_by_user: HashMap<String, HashSet<String>>,
    users_by_task: HashMap<String, HashSet<String>>,
}

/// Many-to-many user/task subscription index.
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<Indices>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Indices> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self, user_id: &str, task_id: &str) {
        let mut indices = self.lock();
        indices
            .tasks_by_user
            .entry(user_id.to_string())
            .or_default()
            .insert(task_id.to_string());
        indices
            .users_by_task
            .entry(task_id.to_string())
            .or_default()
            .insert(user_id.to_string());
    }

    pub fn unsubscribe(&self, user_id: &str, task_id: &str) {
        let mut indices = self.lock();
        if let Some(tasks) = indices.tasks_by_user.get_mut(user_id) {
            tasks.remove(task_id);
            if tasks.is_empty() {
                indices.tasks_by_user.remove(user_id);
            }
        }
        if let Some(users) = indices.users_by_task.get_mut(task_id) {
            users.remove(user_id);
            if users.is_empty() {
                indices.users_by_task.remove(task_id);
            }
        }
    }

    /// Removes the user from every task's subscriber set. Called when a
    /// user's last connection goes away.
    pub fn drop_user(&self, user_id: &str) {
        let mut indices = self.lock();
        let Some(tasks) = indices.tasks_by_user.remove(user_id) else {
            return;
        };
        for task_id in tasks {
            if let Some(users) = indices.users_by_task.get_mut(&task_id) {
                users.remove(user_id);
                if users.is_empty() {
                    indices.users_by_task.remove(&task_id);
                }
            }
        }
    }

    /// Removes every subscriber of a task. Used after a task-deleted
    /// broadcast to force-unsubscribe its audience.
    pub fn drop_task(&self, task_id: &str) -> HashSet<String> {
        let mut indices = self.lock();
        let Some(users) = indices.users_by_task.remove(task_id) else {
            return HashSet::new();
        };
        for user_id in &users {
            if let Some(tasks) = indices.tasks_by_user.get_mut(user_id) {
                tasks.remove(task_id);
                if tasks.is_empty() {
                    indices.tasks_by_user.remove(user_id);
                }
            }
        }
        users
    }

    pub fn subscribers_of(&self, task_id: &str) -> HashSet<String> {
        self.lock()
            .users_by_task
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn tasks_of(&self, user_id: &str) -> HashSet<String> {
        self.lock()
            .tasks_by_user
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of users with at least one subscription.
    pub fn user_count(&self) -> usize {
        self.lock().tasks_by_user.len()
    }

    /// Number of tasks with at least one subscriber.
    pub fn task_count(&self) -> usize {
        self.lock().users_by_task.len()
    }

    /// Total number of (user, task) subscription pairs.
    pub fn subscription_count(&self) -> usize {
        self.lock()
            .tasks_by_user
            .values()
            .map(|tasks| tasks.len())
            .sum()
    }
}
