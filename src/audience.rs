//! Audience gate and the admin tier simulation.
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::model::{Audience, Schedulable, Tier};
use crate::window::{LifecycleState, Window};

/// Everything the gate needs to know about the person looking at the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerContext {
    pub viewer_id: String,
    /// Real entitlement as last known by the caller.
    pub tier: Tier,
    pub is_admin: bool,
    /// Only honoured when `is_admin` is set.
    pub simulated_tier: Option<Tier>,
}

impl ViewerContext {
    pub fn viewer(viewer_id: impl Into<String>, tier: Tier) -> Self {
        Self {
            viewer_id: viewer_id.into(),
            tier,
            is_admin: false,
            simulated_tier: None,
        }
    }

    /// Admins hold a premium entitlement.
    pub fn admin(viewer_id: impl Into<String>) -> Self {
        Self {
            viewer_id: viewer_id.into(),
            tier: Tier::Premium,
            is_admin: true,
            simulated_tier: None,
        }
    }

    pub fn with_simulation(mut self, tier: Option<Tier>) -> Self {
        self.simulated_tier = tier;
        self
    }

    pub fn effective_tier(&self) -> Tier {
        match (self.is_admin, self.simulated_tier) {
            (true, Some(simulated)) => simulated,
            _ => self.tier,
        }
    }
}

pub fn allows(audience: Audience, tier: Tier) -> bool {
    match audience {
        Audience::All => true,
        Audience::Premium => tier == Tier::Premium,
        Audience::Free => tier == Tier::Free,
    }
}

pub fn is_visible<E: Schedulable + ?Sized>(entity: &E, viewer: &ViewerContext) -> bool {
    let tier = viewer.effective_tier();
    let visible = allows(entity.audience(), tier);
    if !visible {
        debug!(
            id = entity.id(),
            audience = entity.audience().as_str(),
            tier = tier.as_str(),
            "hidden by audience gate"
        );
    }
    visible
}

/// Entities currently active and visible to `viewer`, in input order.
pub fn visible_now<'a, E: Schedulable>(
    entities: &'a [E],
    viewer: &ViewerContext,
    now: DateTime<Utc>,
) -> Vec<&'a E> {
    entities
        .iter()
        .filter(|e| Window::of(*e).state_at(now) == LifecycleState::Active)
        .filter(|e| is_visible(*e, viewer))
        .collect()
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("viewer {0} is not an admin and cannot simulate a tier")]
pub struct NotAdmin(pub String);

/// Single writer of the operator-toggled simulated tier.
///
/// Readers never see the watch channel directly; they receive a
/// [`ViewerContext`] snapshot from [`TierSimulation::context_for`].
#[derive(Debug)]
pub struct TierSimulation {
    tx: watch::Sender<Option<Tier>>,
}

impl Default for TierSimulation {
    fn default() -> Self {
        Self::new()
    }
}

impl TierSimulation {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn simulate(&self, actor: &ViewerContext, tier: Option<Tier>) -> Result<(), NotAdmin> {
        if !actor.is_admin {
            return Err(NotAdmin(actor.viewer_id.clone()));
        }
        info!(
            admin = %actor.viewer_id,
            tier = tier.map(|t| t.as_str()).unwrap_or("none"),
            "tier simulation changed"
        );
        self.tx.send_replace(tier);
        Ok(())
    }

    pub fn current(&self) -> Option<Tier> {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Tier>> {
        self.tx.subscribe()
    }

    pub fn context_for(&self, viewer: &ViewerContext) -> ViewerContext {
        if viewer.is_admin {
            viewer.clone().with_simulation(self.current())
        } else {
            viewer.clone().with_simulation(None)
        }
    }
}
