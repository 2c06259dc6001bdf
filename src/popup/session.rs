use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::audience::ViewerContext;
use crate::model::{EntityId, PopupCandidate, Trigger};
use crate::popup::select_popup;
use crate::portal::{PopupSource, SubscriptionLookup, TriggerContext};

/// Popup ids already shown in this session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSeenSet {
    ids: HashSet<EntityId>,
}

impl SessionSeenSet {
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn insert(&mut self, id: &str) -> bool {
        self.ids.insert(id.to_string())
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Proof that a popup is on screen. Closing consumes the display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopupTicket {
    pub popup: PopupCandidate,
    number: u64,
    session_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Display(PopupTicket),
    /// Nothing to show. For a logout trigger the caller proceeds with logout.
    NoPopup,
    /// Another popup is open or an evaluation is already running.
    Suppressed,
    /// The consumer detached while the evaluation was in flight.
    Discarded,
}

impl TriggerOutcome {
    pub fn ticket(&self) -> Option<&PopupTicket> {
        match self {
            TriggerOutcome::Display(ticket) => Some(ticket),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Idle,
    Evaluating,
    Open { number: u64 },
}

#[derive(Debug)]
struct SessionState {
    session_id: Uuid,
    seen: SessionSeenSet,
    slot: Slot,
    epoch: u64,
    next_ticket: u64,
}

/// Client-side popup state for one signed-in session.
pub struct PopupSession {
    source: Arc<dyn PopupSource>,
    lookup: Arc<dyn SubscriptionLookup>,
    state: Mutex<SessionState>,
}

impl PopupSession {
    pub fn new(source: Arc<dyn PopupSource>, lookup: Arc<dyn SubscriptionLookup>) -> Self {
        Self {
            source,
            lookup,
            state: Mutex::new(SessionState {
                session_id: Uuid::new_v4(),
                seen: SessionSeenSet::default(),
                slot: Slot::Idle,
                epoch: 0,
                next_ticket: 1,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        // State stays consistent under every early return, so a poisoned
        // lock is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn session_id(&self) -> Uuid {
        self.lock().session_id
    }

    pub fn seen(&self) -> SessionSeenSet {
        self.lock().seen.clone()
    }

    /// Login: fresh session id and an empty seen set.
    pub fn start_session(&self) -> Uuid {
        let mut state = self.lock();
        state.session_id = Uuid::new_v4();
        state.seen.clear();
        state.slot = Slot::Idle;
        state.epoch += 1;
        info!(session_id = %state.session_id, "popup session started");
        state.session_id
    }

    /// Logout: forget everything shown in this session.
    pub fn end_session(&self) {
        let mut state = self.lock();
        state.seen.clear();
        state.slot = Slot::Idle;
        state.epoch += 1;
        info!(session_id = %state.session_id, "popup session ended");
    }

    /// The consumer went away; anything in flight is dropped on arrival.
    pub fn detach(&self) {
        let mut state = self.lock();
        state.epoch += 1;
        state.slot = Slot::Idle;
    }

    pub fn is_open(&self) -> bool {
        matches!(self.lock().slot, Slot::Open { .. })
    }

    #[instrument(skip_all, fields(trigger = ctx.trigger.as_str()))]
    pub async fn on_trigger(
        &self,
        ctx: &TriggerContext,
        viewer: &ViewerContext,
        now: DateTime<Utc>,
    ) -> TriggerOutcome {
        let (epoch, seen) = {
            let mut state = self.lock();
            if state.slot != Slot::Idle {
                debug!(slot = ?state.slot, "trigger ignored while popup busy");
                return TriggerOutcome::Suppressed;
            }
            state.slot = Slot::Evaluating;
            (state.epoch, state.seen.clone())
        };
        let mut evaluating = EvaluatingGuard {
            session: self,
            epoch,
            armed: true,
        };

        let winner = match self.source.fetch_candidates(ctx).await {
            Ok(candidates) => {
                select_popup(&candidates, ctx, viewer, &seen, self.lookup.as_ref(), now).await
            }
            Err(err) => {
                warn!(?err, "failed to fetch popup candidates");
                None
            }
        };

        evaluating.armed = false;
        let mut state = self.lock();
        if state.epoch != epoch {
            debug!("discarding popup selection for detached consumer");
            return TriggerOutcome::Discarded;
        }
        match winner {
            Some(popup) => {
                let number = state.next_ticket;
                state.next_ticket += 1;
                state.slot = Slot::Open { number };
                TriggerOutcome::Display(PopupTicket {
                    popup,
                    number,
                    session_id: state.session_id,
                })
            }
            None => {
                state.slot = Slot::Idle;
                if ctx.trigger == Trigger::Logout {
                    debug!("no logout popup; proceed with logout");
                }
                TriggerOutcome::NoPopup
            }
        }
    }

    /// Close the popup behind `ticket`. Returns `false` if it was already
    /// closed, so duplicate close events record nothing.
    pub fn close(&self, ticket: &PopupTicket) -> bool {
        {
            let mut state = self.lock();
            let current = state.slot == Slot::Open { number: ticket.number }
                && state.session_id == ticket.session_id;
            if !current {
                return false;
            }
            state.slot = Slot::Idle;
            state.seen.insert(&ticket.popup.id);
        }
        self.spawn_record_view(ticket.popup.id.clone());
        true
    }

    fn spawn_record_view(&self, popup_id: EntityId) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(%popup_id, "no runtime available; popup view not recorded");
            return;
        };
        let source = Arc::clone(&self.source);
        handle.spawn(async move {
            if let Err(err) = source.record_view(&popup_id).await {
                warn!(?err, %popup_id, "failed to record popup view");
            }
        });
    }
}

/// Frees the slot if an evaluation is dropped before it finishes.
struct EvaluatingGuard<'a> {
    session: &'a PopupSession,
    epoch: u64,
    armed: bool,
}

impl Drop for EvaluatingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.session.lock();
        if state.epoch == self.epoch && state.slot == Slot::Evaluating {
            debug!("popup evaluation cancelled");
            state.slot = Slot::Idle;
        }
    }
}
