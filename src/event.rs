//! Structured events emitted by the queue on every state change.
//!
//! Consumers subscribe to the event stream to build dashboards, audit logs,
//! or test assertions. Events are broadcast; a slow or missing receiver
//! never holds up scheduling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::WorkId;

/// A structured event emitted by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Appended to the pending sequence (no free slot).
    WorkQueued { id: WorkId, front: bool },
    /// Marked active and handed to the executor.
    WorkDispatched { id: WorkId },
    /// Moved to the head of the pending sequence.
    WorkPromoted { id: WorkId },
    /// Removed from the pending sequence before dispatch.
    WorkCancelled { id: WorkId },
    /// Task body finished and its slot was released.
    WorkCompleted { id: WorkId, panicked: bool },
}

impl EventKind {
    /// The work item this event is about.
    pub fn work_id(&self) -> WorkId {
        match self {
            EventKind::WorkQueued { id, .. }
            | EventKind::WorkDispatched { id }
            | EventKind::WorkPromoted { id }
            | EventKind::WorkCancelled { id }
            | EventKind::WorkCompleted { id, .. } => *id,
        }
    }
}
