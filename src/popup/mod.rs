//! Popup eligibility: filter candidates synchronously, then pick at most one.
//!
//! The pipeline has two phases. [`eligible_candidates`] does every check that
//! needs no I/O (window, trigger match, session dedup) and fixes the stable
//! order. [`select_popup`] then walks that order and runs the audience gate,
//! which may suspend on a subscription lookup for premium-only candidates.
//! The walk stops at the first winner.

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use crate::audience::{allows, ViewerContext};
use crate::error::EngineError;
use crate::model::{Audience, PopupCandidate, Schedulable, ShowFrequency, Tier, Trigger};
use crate::portal::{SubscriptionLookup, TriggerContext};
use crate::window::{LifecycleState, Window};

pub mod session;

pub use session::{PopupSession, PopupTicket, SessionSeenSet, TriggerOutcome};

/// Every target the candidate names must equal the context's, and a
/// page-specific candidate must name at least one.
pub fn matches_trigger(candidate: &PopupCandidate, ctx: &TriggerContext) -> bool {
    if candidate.trigger != ctx.trigger {
        return false;
    }
    if candidate.trigger != Trigger::PageSpecific {
        return true;
    }
    let pairs = [
        (&candidate.target_page, &ctx.target_page),
        (&candidate.target_video_id, &ctx.target_video_id),
        (&candidate.target_course_id, &ctx.target_course_id),
    ];
    let mut constrained = false;
    for (wanted, actual) in pairs {
        if let Some(wanted) = wanted.as_deref().filter(|w| !w.is_empty()) {
            constrained = true;
            if actual.as_deref() != Some(wanted) {
                return false;
            }
        }
    }
    constrained
}

/// Candidates that pass the synchronous checks, in stable order: creation
/// time ascending, undated last, ties by input position.
pub fn eligible_candidates<'a>(
    candidates: &'a [PopupCandidate],
    ctx: &TriggerContext,
    seen: &SessionSeenSet,
    now: DateTime<Utc>,
) -> Vec<&'a PopupCandidate> {
    let mut eligible: Vec<&PopupCandidate> = candidates
        .iter()
        .filter(|c| matches_trigger(c, ctx))
        .filter(|c| Window::of(*c).state_at(now) == LifecycleState::Active)
        .filter(|c| c.show_frequency == ShowFrequency::Always || !seen.contains(&c.id))
        .collect();
    eligible.sort_by_key(|c| (c.created_at.is_none(), c.created_at));
    eligible
}

/// Resolves the viewer's tier at most once per selection.
struct TierResolver<'a> {
    viewer: &'a ViewerContext,
    lookup: &'a dyn SubscriptionLookup,
    resolved: Option<Option<Tier>>,
}

impl<'a> TierResolver<'a> {
    fn new(viewer: &'a ViewerContext, lookup: &'a dyn SubscriptionLookup) -> Self {
        Self {
            viewer,
            lookup,
            resolved: None,
        }
    }

    /// `None` means the lookup failed; callers fail closed.
    async fn tier(&mut self) -> Option<Tier> {
        if self.viewer.is_admin {
            return Some(self.viewer.effective_tier());
        }
        if let Some(resolved) = self.resolved {
            return resolved;
        }
        let resolved = match self.lookup.current_tier(&self.viewer.viewer_id).await {
            Ok(tier) => Some(tier),
            Err(err) => {
                let err = EngineError::SubscriptionLookupFailed {
                    viewer_id: self.viewer.viewer_id.clone(),
                    reason: format!("{err:#}"),
                };
                warn!(%err, "treating viewer as ineligible for gated popups");
                None
            }
        };
        self.resolved = Some(resolved);
        resolved
    }
}

/// Pick the popup to show for `ctx`, if any.
#[instrument(skip_all, fields(trigger = ctx.trigger.as_str()))]
pub async fn select_popup(
    candidates: &[PopupCandidate],
    ctx: &TriggerContext,
    viewer: &ViewerContext,
    seen: &SessionSeenSet,
    lookup: &dyn SubscriptionLookup,
    now: DateTime<Utc>,
) -> Option<PopupCandidate> {
    let eligible = eligible_candidates(candidates, ctx, seen, now);
    let mut resolver = TierResolver::new(viewer, lookup);
    for candidate in eligible {
        let audience = candidate.audience();
        let passes = match audience {
            Audience::All => true,
            gated => match resolver.tier().await {
                Some(tier) => allows(gated, tier),
                None => false,
            },
        };
        if passes {
            debug!(id = %candidate.id, "popup selected");
            return Some(candidate.clone());
        }
        debug!(id = %candidate.id, audience = audience.as_str(), "popup skipped by audience gate");
    }
    debug!("no popup eligible");
    None
}
