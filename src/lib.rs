//! Task lifecycle tracking with live update fan-out.
//!
//! Every change to a task is recorded as an immutable event in an
//! append-only log; current state, timelines, and metrics are replayed from
//! that log on demand. Connected users subscribe to tasks and receive JSON
//! update frames as events are recorded, including cascaded notices when a
//! task they watch depends on the changed task.
//!
//! Modules:
//! - [`config`]: runtime configuration with validated defaults
//! - [`error`]: crate-wide error and result types
//! - [`status`]: task statuses and the legal transition table
//! - [`event`]: event types and the immutable event record
//! - [`log`]: append-only event storage behind the [`log::EventStore`] trait
//! - [`projection`]: state and timelines replayed from events
//! - [`metrics`]: per-task and team-level figures computed from the log
//! - [`registry`]: bidirectional user/task subscription index
//! - [`connection`]: live connection tracking with best-effort delivery
//! - [`message`]: wire envelopes and inbound client requests
//! - [`directory`]: collaborator boundaries for tasks, dependencies, users
//! - [`broadcast`]: update composition and fan-out to subscribers
//! - [`tracker`]: the lifecycle action facade

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod event;
pub mod log;
pub mod message;
pub mod metrics;
pub mod projection;
pub mod registry;
pub mod status;
pub mod tracker;

pub use error::{Error, Result};
