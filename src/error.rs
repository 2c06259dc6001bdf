//! Error taxonomy for the eligibility and delivery engine.
use thiserror::Error;

use crate::model::EntityId;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A timestamp could not be parsed. Callers treat the bound as absent.
    #[error("unparsable timestamp {value:?}")]
    Parse { value: String },
    #[error("subscription lookup failed for viewer {viewer_id}: {reason}")]
    SubscriptionLookupFailed { viewer_id: String, reason: String },
    #[error("{0} channel is not connected")]
    ChannelUnavailable(&'static str),
    #[error("couldn't mark notification {id} as read, try again")]
    MarkReadFailed {
        id: EntityId,
        push: Option<String>,
        fallback: String,
    },
}

/// Failure reported by a single delivery channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("{0} channel is not connected")]
    Unavailable(&'static str),
    #[error("{channel} channel rejected mark-read: {reason}")]
    Rejected { channel: &'static str, reason: String },
    #[error("{0} channel timed out waiting for confirmation")]
    Timeout(&'static str),
}

