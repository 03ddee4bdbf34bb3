//! Core data model.
//!
//! A work item is one submitted task plus its scheduling state. Identity is a
//! [`WorkId`] ticket; the queue resolves tickets through its own table, so a
//! handle never points into the pending sequence directly.

use std::sync::atomic::{AtomicU8, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Boxed zero-argument task handed to the queue and, later, to an executor.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

// ---------------------------------------------------------------------------
// Work Id
// ---------------------------------------------------------------------------

/// Newtype for work item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum State {
    /// Enqueued, not yet handed to the executor.
    Pending = 0,
    /// Handed to the executor and holding a slot.
    Active = 1,
    /// Removed from the pending sequence before dispatch. Terminal.
    Cancelled = 2,
    /// Task body returned or panicked. Terminal.
    Completed = 3,
}

impl State {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        matches!(
            (self, to),
            (Pending, Active) | (Pending, Cancelled) | (Active, Completed)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Cancelled | State::Completed)
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => State::Pending,
            1 => State::Active,
            2 => State::Cancelled,
            _ => State::Completed,
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Pending => "pending",
            State::Active => "active",
            State::Cancelled => "cancelled",
            State::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

/// State shared between the queue's table entry and the caller's handle.
///
/// Only the queue writes it, always while holding the queue lock. Handles
/// read it lock-free, which keeps the final state observable after the
/// queue has dropped the entry.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: State) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> State {
        State::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: State) {
        self.0.store(state as u8, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Placement
// ---------------------------------------------------------------------------

/// Where an item sits relative to ordinary submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// Submitted at the tail, never promoted.
    Normal,
    /// Moved (or submitted) to the head of the pending sequence.
    Promoted,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Point-in-time view of one tracked work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItemInfo {
    pub id: WorkId,
    pub state: State,
    pub placement: Placement,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of a queue, taken under its lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub limit: usize,
    pub active: usize,
    /// Pending ids in dispatch order.
    pub pending: Vec<WorkId>,
    /// Every item the queue still tracks (pending and active).
    pub items: Vec<WorkItemInfo>,
}
