//! Lifecycle evaluation for anything with an activation window.
//!
//! Evaluation is pure and cheap: parsing borrows the raw strings and the
//! comparison itself is a handful of branches, so it is safe to call on every
//! countdown tick.
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::EngineError;
use crate::model::Schedulable;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Inactive,
    Scheduled,
    Active,
    Expired,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Inactive => "inactive",
            LifecycleState::Scheduled => "scheduled",
            LifecycleState::Active => "active",
            LifecycleState::Expired => "expired",
        }
    }
}

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// Parse a store timestamp. Naive values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, EngineError> {
    let trimmed = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Ok(naive.and_utc());
        }
    }
    Err(EngineError::Parse {
        value: raw.to_string(),
    })
}

/// Lenient variant: empty or malformed input becomes an absent bound.
pub fn parse_bound(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw.filter(|s| !s.trim().is_empty())?;
    match parse_timestamp(raw) {
        Ok(dt) => Some(dt),
        Err(err) => {
            warn!(%err, "ignoring window bound");
            None
        }
    }
}

/// Parsed activation window of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub is_active: bool,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl Window {
    pub fn new(is_active: bool, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Self {
            is_active,
            start,
            end,
        }
    }

    pub fn of<E: Schedulable + ?Sized>(entity: &E) -> Self {
        Self::new(
            entity.is_active(),
            parse_bound(entity.start_raw()),
            parse_bound(entity.end_raw()),
        )
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> LifecycleState {
        evaluate(now, self.start, self.end, self.is_active)
    }
}

pub fn evaluate(
    now: DateTime<Utc>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    is_active: bool,
) -> LifecycleState {
    if !is_active {
        return LifecycleState::Inactive;
    }
    match (start, end) {
        // Degenerate window: no active period. An inverted window is not
        // reordered; it stays scheduled until the later bound passes.
        (Some(start), Some(end)) if end <= start => {
            if now > start || (end == start && now == start) {
                LifecycleState::Expired
            } else {
                LifecycleState::Scheduled
            }
        }
        _ => {
            if start.is_some_and(|s| now < s) {
                LifecycleState::Scheduled
            } else if end.is_some_and(|e| now > e) {
                LifecycleState::Expired
            } else {
                LifecycleState::Active
            }
        }
    }
}

pub fn evaluate_window<E: Schedulable + ?Sized>(entity: &E, now: DateTime<Utc>) -> LifecycleState {
    Window::of(entity).state_at(now)
}
