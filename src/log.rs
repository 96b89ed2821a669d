//! Append-only event log.
//!
//! The log is the source of truth: state and metrics are derived from it and
//! never stored authoritatively anywhere else. Storage is behind the
//! [`EventStore`] trait so a durable backend can replace the in-memory one
//! without touching lifecycle or metrics logic.
//!
//! Ordering contract: events for one task are totally ordered by timestamp,
//! ties broken by insertion order. Appends to the same task are serialized;
//! appends to different tasks proceed without shared contention beyond a
//! brief map lookup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::event::Event;

/// Trait for event storage backends.
pub trait EventStore: Send + Sync {
    /// Appends an event to the task's sequence.
    fn append(&self, event: Event) -> Result<()>;

    /// Returns the task's events in insertion order; empty if unknown.
    fn for_task(&self, task_id: &str) -> Result<Vec<Event>>;

    /// Returns every task id with at least one event.
    fn task_ids(&self) -> Result<Vec<String>>;
}

/// In-memory event store with per-task locking.
#[derive(Default)]
pub struct InMemoryEventStore {
    tasks: RwLock<HashMap<String, Arc<Mutex<Vec<Event>>>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sequence(&self, task_id: &str) -> Arc<Mutex<Vec<Event>>> {
        if let Some(seq) = self
            .tasks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(task_id)
        {
            return Arc::clone(seq);
        }
        let mut tasks = self
            .tasks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(tasks.entry(task_id.to_string()).or_default())
    }
}

impl EventStore for InMemoryEventStore {
    fn append(&self, event: Event) -> Result<()> {
        let seq = self.sequence(&event.task_id);
        let mut events = seq.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        events.push(event);
        Ok(())
    }

    fn for_task(&self, task_id: &str) -> Result<Vec<Event>> {
        let seq = {
            let tasks = self
                .tasks
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match tasks.get(task_id) {
                Some(seq) => Arc::clone(seq),
                None => return Ok(Vec::new()),
            }
        };
        let events = seq.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(events.clone())
    }

    fn task_ids(&self) -> Result<Vec<String>> {
        let tasks = self
            .tasks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(tasks.keys().cloned().collect())
    }
}

/// Facade over an [`EventStore`] that assigns ids and timestamps and exposes
/// ordered reads.
#[derive(Clone)]
pub struct EventLog {
    store: Arc<dyn EventStore>,
}

impl EventLog {
    pub fn in_memory() -> Self {
        Self::with_store(Arc::new(InMemoryEventStore::new()))
    }

    pub fn with_store(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Appends the event and returns it. Content is never rejected here;
    /// business legality checks belong to the lifecycle layer and run before
    /// this call.
    pub fn append(&self, event: Event) -> Result<Event> {
        self.store.append(event.clone())?;
        tracing::debug!(
            task_id = %event.task_id,
            event_type = %event.event_type,
            "recorded event"
        );
        Ok(event)
    }

    /// The task's events ordered by timestamp, ties broken by insertion
    /// order. Empty if the task is unknown.
    pub fn events(&self, task_id: &str) -> Result<Vec<Event>> {
        let mut events = self.store.for_task(task_id)?;
        events.sort_by_key(|event| event.timestamp);
        Ok(events)
    }

    /// Latest event for the task, if any.
    pub fn latest_event(&self, task_id: &str) -> Result<Option<Event>> {
        Ok(self.events(task_id)?.pop())
    }

    pub fn has_task(&self, task_id: &str) -> Result<bool> {
        Ok(!self.store.for_task(task_id)?.is_empty())
    }

    pub fn task_ids(&self) -> Result<Vec<String>> {
        self.store.task_ids()
    }

    /// Events attributed to a user across all tasks since a cutoff, newest
    /// first. Full scan; acceptable for activity feeds, not a hot path.
    pub fn events_for_user(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<(String, Event)>> {
        let mut matched = Vec::new();
        for task_id in self.task_ids()? {
            for event in self.store.for_task(&task_id)? {
                if event.actor_id.as_deref() == Some(user_id) && event.timestamp >= since {
                    matched.push((task_id.clone(), event));
                }
            }
        }
        matched.sort_by(|left, right| right.1.timestamp.cmp(&left.1.timestamp));
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use chrono::Duration;

    #[test]
    fn events_for_unknown_task_are_empty() {
        let log = EventLog::in_memory();
        assert!(log.events("missing").expect("events").is_empty());
        assert!(!log.has_task("missing").expect("has_task"));
        assert!(log.latest_event("missing").expect("latest").is_none());
    }

    #[test]
    fn append_preserves_order() {
        let log = EventLog::in_memory();
        log.append(Event::new(EventType::Created, "task-1"))
            .expect("append");
        log.append(Event::new(EventType::StatusChanged, "task-1"))
            .expect("append");

        let events = log.events("task-1").expect("events");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::Created);
        assert_eq!(events[1].event_type, EventType::StatusChanged);
        assert_eq!(
            log.latest_event("task-1").expect("latest").unwrap().event_type,
            EventType::StatusChanged
        );
    }

    #[test]
    fn equal_timestamps_keep_insertion_order() {
        let log = EventLog::in_memory();
        let now = Utc::now();
        for new_value in ["assigned", "in_progress", "blocked"] {
            let mut event = Event::new(EventType::StatusChanged, "task-1");
            event.timestamp = now;
            event.new_value = Some(new_value.to_string());
            log.append(event).expect("append");
        }
        let events = log.events("task-1").expect("events");
        let order: Vec<_> = events
            .iter()
            .map(|event| event.new_value.as_deref().unwrap())
            .collect();
        assert_eq!(order, vec!["assigned", "in_progress", "blocked"]);
    }

    #[test]
    fn events_for_user_filters_and_sorts_newest_first() {
        let log = EventLog::in_memory();
        let base = Utc::now() - Duration::hours(1);

        let mut old = Event::new(EventType::Created, "task-1");
        old.actor_id = Some("alice".to_string());
        old.timestamp = base - Duration::days(2);
        log.append(old).expect("append");

        let mut recent = Event::new(EventType::CommentAdded, "task-2");
        recent.actor_id = Some("alice".to_string());
        recent.timestamp = base + Duration::minutes(10);
        log.append(recent).expect("append");

        let mut newest = Event::new(EventType::Completed, "task-1");
        newest.actor_id = Some("alice".to_string());
        newest.timestamp = base + Duration::minutes(30);
        log.append(newest).expect("append");

        let mut other = Event::new(EventType::Created, "task-3");
        other.actor_id = Some("bob".to_string());
        other.timestamp = base + Duration::minutes(30);
        log.append(other).expect("append");

        let activity = log.events_for_user("alice", base).expect("activity");
        assert_eq!(activity.len(), 2);
        assert_eq!(activity[0].0, "task-1");
        assert_eq!(activity[0].1.event_type, EventType::Completed);
        assert_eq!(activity[1].0, "task-2");
    }

    #[test]
    fn concurrent_appends_to_distinct_tasks() {
        let log = EventLog::in_memory();
        let mut handles = Vec::new();
        for task in 0..8 {
            let log = log.clone();
            handles.push(std::thread::spawn(move || {
                let task_id = format!("task-{task}");
                for _ in 0..50 {
                    log.append(Event::new(EventType::CommentAdded, task_id.as_str()))
                        .expect("append");
                }
            }));
        }
        for handle in handles {
            handle.join().expect("join");
        }
        for task in 0..8 {
            let events = log.events(&format!("task-{task}")).expect("events");
            assert_eq!(events.len(), 50);
        }
    }
}
