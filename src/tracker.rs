//! Lifecycle actions and derived queries.
//!
//! Each action validates against the replayed state, appends events, and
//! only then publishes. Rejections (`NotFound`, `InvalidTransition`,
//! `DependencyUnresolved`) append nothing and broadcast nothing. Validation
//! and append run under a per-task lock so concurrent actions on one task
//! cannot interleave; actions on different tasks proceed independently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::broadcast::Broadcaster;
use crate::config::Config;
use crate::directory::DependencyQuery;
use crate::error::{Error, Result};
use crate::event::{Event, EventType};
use crate::log::EventLog;
use crate::metrics::{self, BottleneckReport, TaskMetrics, VelocityMetrics};
use crate::projection::{self, TaskProjection, TimelineEntry};
use crate::status::TaskStatus;

/// One entry in a user's cross-task activity feed.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub task_id: String,
    pub event: Event,
    pub description: String,
}

/// Complete exportable history of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskHistoryExport {
    pub task_id: String,
    pub total_events: usize,
    pub timeline: Vec<TimelineEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<TaskMetrics>,
    pub current_status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_assignee: Option<String>,
    pub export_timestamp: chrono::DateTime<Utc>,
}

/// Front door for lifecycle actions and analytics queries.
pub struct LifecycleTracker {
    log: EventLog,
    broadcaster: Arc<Broadcaster>,
    dependencies: Arc<dyn DependencyQuery>,
    task_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    velocity_window_days: u32,
}

impl LifecycleTracker {
    pub fn new(
        log: EventLog,
        broadcaster: Arc<Broadcaster>,
        dependencies: Arc<dyn DependencyQuery>,
        config: &Config,
    ) -> Self {
        Self {
            log,
            broadcaster,
            dependencies,
            task_locks: Mutex::new(HashMap::new()),
            velocity_window_days: config.metrics.velocity_window_days,
        }
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    fn task_lock(&self, task_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .task_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(task_id.to_string()).or_default())
    }

    fn current_projection(&self, task_id: &str) -> Result<TaskProjection> {
        let events = self.log.events(task_id)?;
        if events.is_empty() {
            return Err(Error::NotFound(task_id.to_string()));
        }
        Ok(projection::project(task_id, &events))
    }

    /// Raw event append without lifecycle validation, then a best-effort
    /// publish. Escape hatch for callers recording history the lifecycle
    /// methods do not cover; content is never rejected here.
    pub async fn record_event(
        &self,
        task_id: &str,
        event_type: EventType,
        actor_id: Option<&str>,
        old_value: Option<&str>,
        new_value: Option<&str>,
        metadata: HashMap<String, Value>,
    ) -> Result<Event> {
        let mut event = Event::new(event_type, task_id);
        event.actor_id = actor_id.map(str::to_string);
        event.old_value = old_value.map(str::to_string);
        event.new_value = new_value.map(str::to_string);
        event.metadata = metadata;
        let event = self.log.append(event)?;

        self.broadcaster
            .publish(
                task_id,
                event_type.as_str(),
                serde_json::to_value(&event)?,
                actor_id,
            )
            .await;
        Ok(event)
    }

    /// Records the task's `created` event and announces the task to all
    /// connected users. Rejects a task id that already has history.
    pub async fn create_task(
        &self,
        task_id: &str,
        actor_id: Option<&str>,
        metadata: HashMap<String, Value>,
    ) -> Result<Event> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        if self.log.has_task(task_id)? {
            let current = self.current_projection(task_id)?;
            return Err(Error::InvalidTransition {
                from: current.status,
                to: TaskStatus::Created,
            });
        }

        let mut event = Event::new(EventType::Created, task_id);
        event.actor_id = actor_id.map(str::to_string);
        event.metadata = metadata;
        let event = self.log.append(event)?;

        drop(_guard);

        self.broadcaster.publish_task_created(task_id, actor_id).await;
        Ok(event)
    }

    /// Shared transition path: validate against the table, check the
    /// dependency precondition when entering `in_progress`, append the
    /// status event (plus terminal marker), publish.
    async fn transition(
        &self,
        task_id: &str,
        to: TaskStatus,
        actor_id: Option<&str>,
        metadata: HashMap<String, Value>,
    ) -> Result<Event> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let from = self.current_projection(task_id)?.status;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition { from, to });
        }
        // Dependencies gate the initial start; resuming from blocked or
        // review does not re-check them.
        let starting = to == TaskStatus::InProgress
            && matches!(from, TaskStatus::Created | TaskStatus::Assigned);
        if starting {
            let resolved = self
                .dependencies
                .dependencies_resolved(task_id)
                .map_err(|err| Error::CollaboratorUnavailable(err.to_string()))?;
            if !resolved {
                return Err(Error::DependencyUnresolved(task_id.to_string()));
            }
        }

        let mut event = Event::new(EventType::StatusChanged, task_id);
        event.actor_id = actor_id.map(str::to_string);
        event.old_value = Some(from.as_str().to_string());
        event.new_value = Some(to.as_str().to_string());
        event.metadata = metadata.clone();
        let event = self.log.append(event)?;

        // Terminal transitions also leave a dedicated marker event; metrics
        // anchor completion timestamps on it.
        let marker = match to {
            TaskStatus::Completed => Some(EventType::Completed),
            TaskStatus::Cancelled => Some(EventType::Cancelled),
            _ => None,
        };
        if let Some(marker) = marker {
            let mut marker_event = Event::new(marker, task_id);
            marker_event.actor_id = actor_id.map(str::to_string);
            marker_event.metadata = metadata;
            self.log.append(marker_event)?;
        }

        drop(_guard);

        let mut payload = serde_json::json!({
            "old_status": from.as_str(),
            "new_status": to.as_str(),
        });
        if let Some(reason) = event.metadata.get("reason") {
            payload["reason"] = reason.clone();
        }
        self.broadcaster
            .publish(task_id, "status_changed", payload, actor_id)
            .await;
        Ok(event)
    }

    /// Explicit status change, e.g. moving a task into `review`.
    pub async fn change_status(
        &self,
        task_id: &str,
        to: TaskStatus,
        actor_id: Option<&str>,
    ) -> Result<Event> {
        self.transition(task_id, to, actor_id, HashMap::new()).await
    }

    /// Assigns the task. A freshly created task also moves to `assigned`;
    /// reassignment in later statuses records the handover without touching
    /// status. Terminal tasks reject.
    pub async fn assign(
        &self,
        task_id: &str,
        assignee: &str,
        actor_id: Option<&str>,
    ) -> Result<Event> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let current = self.current_projection(task_id)?;
        if current.status.is_terminal() {
            return Err(Error::InvalidTransition {
                from: current.status,
                to: TaskStatus::Assigned,
            });
        }

        let mut event = Event::new(EventType::Assigned, task_id);
        event.actor_id = actor_id.map(str::to_string);
        event.old_value = current.assignee.clone();
        event.new_value = Some(assignee.to_string());
        let event = self.log.append(event)?;

        if current.status == TaskStatus::Created {
            let mut status_event = Event::new(EventType::StatusChanged, task_id);
            status_event.actor_id = actor_id.map(str::to_string);
            status_event.old_value = Some(TaskStatus::Created.as_str().to_string());
            status_event.new_value = Some(TaskStatus::Assigned.as_str().to_string());
            self.log.append(status_event)?;
        }

        drop(_guard);

        self.broadcaster
            .publish(
                task_id,
                "assigned",
                serde_json::json!({ "assignee": assignee }),
                actor_id,
            )
            .await;
        Ok(event)
    }

    /// Clears the assignee without changing status.
    pub async fn unassign(&self, task_id: &str, actor_id: Option<&str>) -> Result<Event> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let current = self.current_projection(task_id)?;
        if current.status.is_terminal() {
            return Err(Error::InvalidTransition {
                from: current.status,
                to: TaskStatus::Assigned,
            });
        }

        let mut event = Event::new(EventType::Unassigned, task_id);
        event.actor_id = actor_id.map(str::to_string);
        event.old_value = current.assignee.clone();
        let event = self.log.append(event)?;

        drop(_guard);

        self.broadcaster
            .publish(task_id, "unassigned", Value::Null, actor_id)
            .await;
        Ok(event)
    }

    /// Moves the task into `in_progress`. Requires every dependency to be
    /// completed.
    pub async fn start(&self, task_id: &str, actor_id: Option<&str>) -> Result<Event> {
        self.transition(task_id, TaskStatus::InProgress, actor_id, HashMap::new())
            .await
    }

    pub async fn block(
        &self,
        task_id: &str,
        reason: &str,
        actor_id: Option<&str>,
    ) -> Result<Event> {
        let metadata = HashMap::from([("reason".to_string(), Value::String(reason.to_string()))]);
        self.transition(task_id, TaskStatus::Blocked, actor_id, metadata)
            .await
    }

    pub async fn unblock(&self, task_id: &str, actor_id: Option<&str>) -> Result<Event> {
        self.transition(task_id, TaskStatus::InProgress, actor_id, HashMap::new())
            .await
    }

    pub async fn request_review(&self, task_id: &str, actor_id: Option<&str>) -> Result<Event> {
        self.transition(task_id, TaskStatus::Review, actor_id, HashMap::new())
            .await
    }

    pub async fn complete(&self, task_id: &str, actor_id: Option<&str>) -> Result<Event> {
        self.transition(task_id, TaskStatus::Completed, actor_id, HashMap::new())
            .await
    }

    pub async fn cancel(
        &self,
        task_id: &str,
        reason: &str,
        actor_id: Option<&str>,
    ) -> Result<Event> {
        let metadata = HashMap::from([("reason".to_string(), Value::String(reason.to_string()))]);
        self.transition(task_id, TaskStatus::Cancelled, actor_id, metadata)
            .await
    }

    pub async fn add_comment(
        &self,
        task_id: &str,
        author_id: &str,
        comment: &str,
    ) -> Result<Event> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        if !self.log.has_task(task_id)? {
            return Err(Error::NotFound(task_id.to_string()));
        }

        let mut event = Event::new(EventType::CommentAdded, task_id);
        event.actor_id = Some(author_id.to_string());
        event
            .metadata
            .insert("comment".to_string(), Value::String(comment.to_string()));
        let event = self.log.append(event)?;

        drop(_guard);

        self.broadcaster
            .publish(
                task_id,
                "comment_added",
                serde_json::json!({ "comment": comment }),
                Some(author_id),
            )
            .await;
        Ok(event)
    }

    pub async fn add_attachment(
        &self,
        task_id: &str,
        filename: &str,
        actor_id: Option<&str>,
    ) -> Result<Event> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        if !self.log.has_task(task_id)? {
            return Err(Error::NotFound(task_id.to_string()));
        }

        let mut event = Event::new(EventType::AttachmentAdded, task_id);
        event.actor_id = actor_id.map(str::to_string);
        event
            .metadata
            .insert("filename".to_string(), Value::String(filename.to_string()));
        let event = self.log.append(event)?;

        drop(_guard);

        self.broadcaster
            .publish(
                task_id,
                "attachment_added",
                serde_json::json!({ "filename": filename }),
                actor_id,
            )
            .await;
        Ok(event)
    }

    /// Records a priority change. The previous priority is derived from the
    /// last recorded change, if any.
    pub async fn change_priority(
        &self,
        task_id: &str,
        priority: &str,
        actor_id: Option<&str>,
    ) -> Result<Event> {
        self.change_field(
            task_id,
            EventType::PriorityChanged,
            priority,
            "priority",
            actor_id,
        )
        .await
    }

    /// Records a due date change (RFC 3339 string, owned by the caller's
    /// task repository).
    pub async fn change_due_date(
        &self,
        task_id: &str,
        due_date: &str,
        actor_id: Option<&str>,
    ) -> Result<Event> {
        self.change_field(
            task_id,
            EventType::DueDateChanged,
            due_date,
            "due_date",
            actor_id,
        )
        .await
    }

    async fn change_field(
        &self,
        task_id: &str,
        event_type: EventType,
        new_value: &str,
        field: &str,
        actor_id: Option<&str>,
    ) -> Result<Event> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let events = self.log.events(task_id)?;
        if events.is_empty() {
            return Err(Error::NotFound(task_id.to_string()));
        }
        let old_value = events
            .iter()
            .rev()
            .find(|event| event.event_type == event_type)
            .and_then(|event| event.new_value.clone());

        let mut event = Event::new(event_type, task_id);
        event.actor_id = actor_id.map(str::to_string);
        event.old_value = old_value;
        event.new_value = Some(new_value.to_string());
        let event = self.log.append(event)?;

        drop(_guard);

        self.broadcaster
            .publish(
                task_id,
                event_type.as_str(),
                serde_json::json!({ field: new_value }),
                actor_id,
            )
            .await;
        Ok(event)
    }

    /// Declares that `task_id` depends on `dependency_id`. The dependency
    /// graph itself lives with the collaborator; this records the audit
    /// event and notifies subscribers.
    pub async fn add_dependency(
        &self,
        task_id: &str,
        dependency_id: &str,
        actor_id: Option<&str>,
    ) -> Result<Event> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        if !self.log.has_task(task_id)? {
            return Err(Error::NotFound(task_id.to_string()));
        }

        let mut event = Event::new(EventType::DependencyAdded, task_id);
        event.actor_id = actor_id.map(str::to_string);
        event.new_value = Some(dependency_id.to_string());
        let event = self.log.append(event)?;

        drop(_guard);

        self.broadcaster
            .publish(
                task_id,
                "dependency_added",
                serde_json::json!({ "dependency_id": dependency_id }),
                actor_id,
            )
            .await;
        Ok(event)
    }

    pub async fn remove_dependency(
        &self,
        task_id: &str,
        dependency_id: &str,
        actor_id: Option<&str>,
    ) -> Result<Event> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        if !self.log.has_task(task_id)? {
            return Err(Error::NotFound(task_id.to_string()));
        }

        let mut event = Event::new(EventType::DependencyRemoved, task_id);
        event.actor_id = actor_id.map(str::to_string);
        event.old_value = Some(dependency_id.to_string());
        let event = self.log.append(event)?;

        drop(_guard);

        self.broadcaster
            .publish(
                task_id,
                "dependency_removed",
                serde_json::json!({ "dependency_id": dependency_id }),
                actor_id,
            )
            .await;
        Ok(event)
    }

    /// Publishes logged hours. The event vocabulary is closed and has no
    /// time entry, so this action broadcasts without appending; the hours
    /// themselves live with the task repository.
    pub async fn log_time(&self, task_id: &str, hours: f64, actor_id: Option<&str>) -> Result<()> {
        if !self.log.has_task(task_id)? {
            return Err(Error::NotFound(task_id.to_string()));
        }
        self.broadcaster
            .publish(
                task_id,
                "time_logged",
                serde_json::json!({ "hours": hours }),
                actor_id,
            )
            .await;
        Ok(())
    }

    /// Announces a deletion and force-unsubscribes the audience. The event
    /// history itself is append-only and survives.
    pub async fn delete_task(&self, task_id: &str, actor_id: Option<&str>) -> Result<()> {
        if !self.log.has_task(task_id)? {
            return Err(Error::NotFound(task_id.to_string()));
        }
        self.broadcaster.publish_task_deleted(task_id, actor_id).await;
        Ok(())
    }

    /// Current replayed state; `None` for an unknown task.
    pub fn get_task_state(&self, task_id: &str) -> Result<Option<TaskProjection>> {
        let events = self.log.events(task_id)?;
        if events.is_empty() {
            return Ok(None);
        }
        Ok(Some(projection::project(task_id, &events)))
    }

    /// Ordered human-readable timeline; empty for an unknown task.
    pub fn get_task_timeline(&self, task_id: &str) -> Result<Vec<TimelineEntry>> {
        let events = self.log.events(task_id)?;
        Ok(projection::timeline(&events))
    }

    /// Metrics computed fresh from the log. For an open task the open
    /// interval runs to the current wall clock, so repeated calls grow.
    pub fn get_task_metrics(&self, task_id: &str) -> Result<Option<TaskMetrics>> {
        let events = self.log.events(task_id)?;
        Ok(TaskMetrics::from_events(task_id, &events, Utc::now()))
    }

    pub fn get_velocity_metrics(&self, days: Option<u32>) -> Result<VelocityMetrics> {
        let days = days.unwrap_or(self.velocity_window_days);
        metrics::velocity(&self.log, days, Utc::now())
    }

    pub fn get_bottleneck_analysis(&self) -> Result<BottleneckReport> {
        metrics::bottlenecks(&self.log, Utc::now())
    }

    pub fn get_status_distribution(&self) -> Result<HashMap<TaskStatus, usize>> {
        let task_ids = self.log.task_ids()?;
        metrics::status_distribution(&self.log, &task_ids)
    }

    /// Cross-task activity feed for one user over a trailing window.
    pub fn get_user_activity(&self, user_id: &str, days: u32) -> Result<Vec<ActivityEntry>> {
        let since = Utc::now() - Duration::days(i64::from(days));
        let entries = self
            .log
            .events_for_user(user_id, since)?
            .into_iter()
            .map(|(task_id, event)| ActivityEntry {
                task_id,
                description: event.describe(),
                event,
            })
            .collect();
        Ok(entries)
    }

    /// Complete history bundle for reporting and export.
    pub fn export_task_history(&self, task_id: &str) -> Result<Option<TaskHistoryExport>> {
        let events = self.log.events(task_id)?;
        if events.is_empty() {
            return Ok(None);
        }
        let projection = projection::project(task_id, &events);
        Ok(Some(TaskHistoryExport {
            task_id: task_id.to_string(),
            total_events: events.len(),
            timeline: projection::timeline(&events),
            metrics: TaskMetrics::from_events(task_id, &events, Utc::now()),
            current_status: projection.status,
            current_assignee: projection.assignee,
            export_timestamp: Utc::now(),
        }))
    }
}
