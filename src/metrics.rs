//! Time-based metrics derived from event sequences.
//!
//! Every figure here is recomputed from the event log on request; nothing is
//! cached authoritatively. Open intervals (a task that is not yet completed)
//! extend to the caller-supplied `now`, so repeated calls for an open task
//! legitimately return growing durations.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::error::Result;
use crate::event::{Event, EventType};
use crate::log::EventLog;
use crate::status::TaskStatus;

fn secs(duration: Duration) -> f64 {
    duration.num_milliseconds() as f64 / 1000.0
}

fn serialize_duration<S: Serializer>(
    duration: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(secs(*duration))
}

fn serialize_duration_opt<S: Serializer>(
    duration: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match duration {
        Some(duration) => serializer.serialize_some(&secs(*duration)),
        None => serializer.serialize_none(),
    }
}

fn serialize_status_durations<S: Serializer>(
    map: &HashMap<TaskStatus, Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    let mut out = serializer.serialize_map(Some(map.len()))?;
    for status in TaskStatus::ALL {
        if let Some(duration) = map.get(&status) {
            out.serialize_entry(status.as_str(), &secs(*duration))?;
        }
    }
    out.end()
}

/// Per-task metrics computed from the task's event sequence.
#[derive(Debug, Clone, Serialize)]
pub struct TaskMetrics {
    pub task_id: String,
    pub total_events: usize,
    pub creation_date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_date: Option<DateTime<Utc>>,
    /// Completion timestamp minus creation timestamp; absent until completed.
    #[serde(serialize_with = "serialize_duration_opt")]
    pub total_time_spent: Option<Duration>,
    /// Accumulated wall time per status, zero-filled for unvisited statuses.
    #[serde(serialize_with = "serialize_status_durations")]
    pub time_in_status: HashMap<TaskStatus, Duration>,
    pub assignment_count: usize,
    pub status_change_count: usize,
    /// Total time spent in `blocked`; absent when zero.
    #[serde(serialize_with = "serialize_duration_opt")]
    pub blocked_time: Option<Duration>,
}

impl TaskMetrics {
    /// Computes metrics from a timestamp-ordered event sequence.
    ///
    /// Returns `None` when the sequence is empty or carries no `created`
    /// event. `now` bounds the open interval of tasks that have not
    /// completed.
    pub fn from_events(task_id: &str, events: &[Event], now: DateTime<Utc>) -> Option<Self> {
        let creation = events
            .iter()
            .find(|event| event.event_type == EventType::Created)?;
        let completion = events
            .iter()
            .find(|event| event.event_type == EventType::Completed);

        let assignment_count = events
            .iter()
            .filter(|event| event.event_type == EventType::Assigned)
            .count();
        let status_change_count = events
            .iter()
            .filter(|event| event.event_type == EventType::StatusChanged)
            .count();

        Some(Self {
            task_id: task_id.to_string(),
            total_events: events.len(),
            creation_date: creation.timestamp,
            completion_date: completion.map(|event| event.timestamp),
            total_time_spent: completion.map(|event| event.timestamp - creation.timestamp),
            time_in_status: time_in_status(events, now),
            assignment_count,
            status_change_count,
            blocked_time: blocked_time(events, now),
        })
    }
}

/// Wall time accumulated in each status.
///
/// Replays `status_changed` events, charging each interval to the status
/// that was current when the interval began. The trailing interval runs to
/// the `completed` event if present, otherwise to `now`.
pub fn time_in_status(events: &[Event], now: DateTime<Utc>) -> HashMap<TaskStatus, Duration> {
    let mut buckets: HashMap<TaskStatus, Duration> = TaskStatus::ALL
        .iter()
        .map(|status| (*status, Duration::zero()))
        .collect();

    let Some(first) = events.first() else {
        return buckets;
    };

    let mut current = TaskStatus::Created;
    let mut entered_at = first.timestamp;

    for event in events {
        if event.event_type != EventType::StatusChanged {
            continue;
        }
        let Some(next) = event
            .new_value
            .as_deref()
            .and_then(|value| value.parse::<TaskStatus>().ok())
        else {
            continue;
        };
        if let Some(bucket) = buckets.get_mut(&current) {
            *bucket += event.timestamp - entered_at;
        }
        current = next;
        entered_at = event.timestamp;
    }

    let end = events
        .iter()
        .find(|event| event.event_type == EventType::Completed)
        .map(|event| event.timestamp)
        .unwrap_or(now);
    if let Some(bucket) = buckets.get_mut(&current) {
        *bucket += end - entered_at;
    }

    buckets
}

/// Total time spent blocked, `None` when zero.
///
/// Sums intervals between a `status_changed` into `blocked` and the next
/// `status_changed` away from it; a still-blocked task accrues up to `now`.
pub fn blocked_time(events: &[Event], now: DateTime<Utc>) -> Option<Duration> {
    let mut total = Duration::zero();
    let mut blocked_since: Option<DateTime<Utc>> = None;

    for event in events {
        if event.event_type != EventType::StatusChanged {
            continue;
        }
        let entering_blocked = event.new_value.as_deref() == Some(TaskStatus::Blocked.as_str());
        match (blocked_since, entering_blocked) {
            (None, true) => blocked_since = Some(event.timestamp),
            (Some(since), false) => {
                total += event.timestamp - since;
                blocked_since = None;
            }
            _ => {}
        }
    }

    if let Some(since) = blocked_since {
        total += now - since;
    }

    (total > Duration::zero()).then_some(total)
}

/// Team-level throughput over a trailing window.
#[derive(Debug, Clone, Serialize)]
pub struct VelocityMetrics {
    pub period_days: u32,
    pub tasks_completed: usize,
    pub tasks_created: usize,
    pub completion_rate: f64,
    pub avg_completion_per_day: f64,
}

/// Counts `created` and `completed` events across all tasks with timestamps
/// inside the trailing window.
pub fn velocity(log: &EventLog, days: u32, now: DateTime<Utc>) -> Result<VelocityMetrics> {
    let cutoff = now - Duration::days(i64::from(days));
    let mut completed = 0usize;
    let mut created = 0usize;

    for task_id in log.task_ids()? {
        for event in log.events(&task_id)? {
            if event.timestamp < cutoff {
                continue;
            }
            match event.event_type {
                EventType::Completed => completed += 1,
                EventType::Created => created += 1,
                _ => {}
            }
        }
    }

    Ok(VelocityMetrics {
        period_days: days,
        tasks_completed: completed,
        tasks_created: created,
        completion_rate: completed as f64 / created.max(1) as f64,
        avg_completion_per_day: completed as f64 / f64::from(days.max(1)),
    })
}

/// A task with nonzero blocked time, for bottleneck reports.
#[derive(Debug, Clone, Serialize)]
pub struct BlockedTaskEntry {
    pub task_id: String,
    #[serde(serialize_with = "serialize_duration")]
    pub blocked_time: Duration,
}

/// Workflow bottleneck analysis across all tasks.
#[derive(Debug, Clone, Serialize)]
pub struct BottleneckReport {
    /// Mean accumulated seconds per status across all tasks.
    pub avg_time_per_status: HashMap<TaskStatus, f64>,
    /// Status with the highest mean; `None` when no task has metrics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bottleneck_status: Option<TaskStatus>,
    pub blocked_tasks: Vec<BlockedTaskEntry>,
    pub blocked_tasks_count: usize,
    #[serde(serialize_with = "serialize_duration")]
    pub total_blocked_time: Duration,
}

/// Computes per-status means over every task in the log and flags the status
/// with the highest mean. Tasks without a `created` event contribute nothing.
pub fn bottlenecks(log: &EventLog, now: DateTime<Utc>) -> Result<BottleneckReport> {
    let mut samples: HashMap<TaskStatus, Vec<f64>> = TaskStatus::ALL
        .iter()
        .map(|status| (*status, Vec::new()))
        .collect();
    let mut blocked_tasks = Vec::new();
    let mut total_blocked = Duration::zero();

    let mut task_ids = log.task_ids()?;
    task_ids.sort();
    for task_id in task_ids {
        let events = log.events(&task_id)?;
        let Some(metrics) = TaskMetrics::from_events(&task_id, &events, now) else {
            continue;
        };
        for (status, duration) in &metrics.time_in_status {
            if let Some(bucket) = samples.get_mut(status) {
                bucket.push(secs(*duration));
            }
        }
        if let Some(blocked) = metrics.blocked_time {
            total_blocked += blocked;
            blocked_tasks.push(BlockedTaskEntry {
                task_id,
                blocked_time: blocked,
            });
        }
    }

    let avg_time_per_status: HashMap<TaskStatus, f64> = samples
        .into_iter()
        .map(|(status, values)| {
            let avg = if values.is_empty() {
                0.0
            } else {
                values.iter().sum::<f64>() / values.len() as f64
            };
            (status, avg)
        })
        .collect();

    let bottleneck_status = TaskStatus::ALL
        .iter()
        .copied()
        .max_by(|left, right| {
            let left_avg = avg_time_per_status.get(left).copied().unwrap_or(0.0);
            let right_avg = avg_time_per_status.get(right).copied().unwrap_or(0.0);
            left_avg.total_cmp(&right_avg)
        })
        .filter(|status| avg_time_per_status.get(status).copied().unwrap_or(0.0) > 0.0);

    blocked_tasks.sort_by(|left, right| right.blocked_time.cmp(&left.blocked_time));
    let blocked_tasks_count = blocked_tasks.len();

    Ok(BottleneckReport {
        avg_time_per_status,
        bottleneck_status,
        blocked_tasks,
        blocked_tasks_count,
        total_blocked_time: total_blocked,
    })
}

/// Current status counts for the given tasks, zero-filled for every status.
/// Unknown tasks count as `created`, matching the projection default.
pub fn status_distribution(
    log: &EventLog,
    task_ids: &[String],
) -> Result<HashMap<TaskStatus, usize>> {
    let mut counts: HashMap<TaskStatus, usize> = TaskStatus::ALL
        .iter()
        .map(|status| (*status, 0usize))
        .collect();
    for task_id in task_ids {
        let events = log.events(task_id)?;
        let projection = crate::projection::project(task_id, &events);
        if let Some(count) = counts.get_mut(&projection.status) {
            *count += 1;
        }
    }
    Ok(counts)
}
