use std::collections::HashMap;

use crate::model::EntityId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    /// A mark-read submission is running.
    InFlight,
    /// A channel accepted the mark-read but no refreshed state has shown it
    /// read yet.
    AwaitingConfirmation,
}

/// Notification ids with a mark-read between submission and confirmation.
#[derive(Debug, Clone, Default)]
pub struct PendingReadLedger {
    entries: HashMap<EntityId, PendingState>,
}

impl PendingReadLedger {
    /// Returns `false` if the id is already pending.
    pub fn try_begin(&mut self, id: &str) -> bool {
        if self.entries.contains_key(id) {
            return false;
        }
        self.entries.insert(id.to_string(), PendingState::InFlight);
        true
    }

    pub fn await_confirmation(&mut self, id: &str) {
        if let Some(state) = self.entries.get_mut(id) {
            *state = PendingState::AwaitingConfirmation;
        }
    }

    pub fn release(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Drop entries the caller reports as confirmed for their state.
    pub fn release_confirmed(
        &mut self,
        mut confirmed: impl FnMut(&str, PendingState) -> bool,
    ) -> usize {
        let before = self.entries.len();
        self.entries.retain(|id, state| !confirmed(id, *state));
        before - self.entries.len()
    }

    pub fn state(&self, id: &str) -> Option<PendingState> {
        self.entries.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
