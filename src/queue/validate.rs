//! Invariant checks over the queue's locked state.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::model::State;

use super::Inner;

impl Inner {
    pub(super) fn check(&self, limit: usize) -> Result<()> {
        let mut violations = Vec::new();

        if self.active > limit {
            violations.push(format!("active count {} exceeds limit {limit}", self.active));
        }

        let mut active_entries = 0;
        let mut pending_entries = 0;
        for (id, entry) in &self.entries {
            match entry.cell.get() {
                State::Active => {
                    active_entries += 1;
                    if entry.task.is_some() {
                        violations.push(format!("active item {id} still holds its task"));
                    }
                }
                State::Pending => {
                    pending_entries += 1;
                    if entry.task.is_none() {
                        violations.push(format!("pending item {id} has no task"));
                    }
                }
                terminal => {
                    violations.push(format!("{terminal} item {id} is still tracked"));
                }
            }
        }

        if active_entries != self.active {
            violations.push(format!(
                "active count {} but {active_entries} items are active",
                self.active
            ));
        }

        let mut seen = HashSet::with_capacity(self.pending.len());
        for id in &self.pending {
            if !seen.insert(*id) {
                violations.push(format!("item {id} appears more than once in pending"));
            }
            match self.entries.get(id).map(|entry| entry.cell.get()) {
                Some(State::Pending) => {}
                Some(state) => violations.push(format!("{state} item {id} is in pending")),
                None => violations.push(format!("untracked item {id} is in pending")),
            }
        }

        if pending_entries != seen.len() {
            violations.push(format!(
                "{pending_entries} items are pending but {} are in the pending sequence",
                seen.len()
            ));
        }

        if !self.pending.is_empty() && self.active < limit {
            violations.push(format!(
                "{} items pending with {} of {limit} slots in use",
                self.pending.len(),
                self.active
            ));
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(Error::InvariantViolation(violations.join("; ")))
        }
    }
}
