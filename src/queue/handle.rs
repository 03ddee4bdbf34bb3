use std::sync::{Arc, Weak};

use crate::model::{State, StateCell, WorkId};

use super::Shared;

/// Handle to one submission.
///
/// Lets the holder cancel or reprioritize the item while it is still
/// pending. The handle only carries the item's id and a weak link to the
/// queue; all effects are applied by the queue under its lock. Calls on an
/// item that is no longer pending, or whose queue is gone, do nothing.
#[derive(Debug, Clone)]
pub struct WorkItem {
    id: WorkId,
    cell: Arc<StateCell>,
    queue: Weak<Shared>,
}

impl WorkItem {
    pub(super) fn new(id: WorkId, cell: Arc<StateCell>, queue: Weak<Shared>) -> Self {
        Self { id, cell, queue }
    }

    pub fn id(&self) -> WorkId {
        self.id
    }

    /// Current lifecycle state. May be stale as soon as it is returned.
    pub fn state(&self) -> State {
        self.cell.get()
    }

    /// True while the item holds an executor slot.
    pub fn is_running(&self) -> bool {
        self.state() == State::Active
    }

    /// Remove the item from the pending sequence.
    ///
    /// Returns true if this call cancelled it. Dispatched work is never
    /// interrupted.
    pub fn cancel(&self) -> bool {
        match self.queue.upgrade() {
            Some(queue) => queue.cancel(self.id),
            None => false,
        }
    }

    /// Move the item to the head of the pending sequence.
    pub fn move_to_front(&self) {
        if let Some(queue) = self.queue.upgrade() {
            queue.move_to_front(self.id);
        }
    }
}
