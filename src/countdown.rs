//! Countdown and urgency for banner and coupon displays.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const SECOND_MS: i64 = 1_000;
const MINUTE_MS: i64 = 60 * SECOND_MS;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Expired,
    Critical,
    Urgent,
    Warning,
    Normal,
}

impl Urgency {
    /// Exactly 24h left is already urgent; 72h and 168h still belong to the
    /// nearer tier.
    pub fn from_remaining_ms(remaining_ms: i64) -> Self {
        match remaining_ms {
            r if r <= 0 => Urgency::Expired,
            r if r < 24 * HOUR_MS => Urgency::Critical,
            r if r <= 72 * HOUR_MS => Urgency::Urgent,
            r if r <= 168 * HOUR_MS => Urgency::Warning,
            _ => Urgency::Normal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Expired => "expired",
            Urgency::Critical => "critical",
            Urgency::Urgent => "urgent",
            Urgency::Warning => "warning",
            Urgency::Normal => "normal",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TimeParts {
    pub days: i64,
    pub hours: i64,
    pub minutes: i64,
    pub seconds: i64,
}

impl TimeParts {
    /// Floor decomposition; negative input yields all zeros.
    pub fn from_ms(ms: i64) -> Self {
        if ms <= 0 {
            return Self::default();
        }
        Self {
            days: ms / DAY_MS,
            hours: (ms % DAY_MS) / HOUR_MS,
            minutes: (ms % HOUR_MS) / MINUTE_MS,
            seconds: (ms % MINUTE_MS) / SECOND_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Countdown {
    pub parts: TimeParts,
    pub urgency: Urgency,
    pub remaining_ms: i64,
}

impl Countdown {
    pub fn is_expired(&self) -> bool {
        self.urgency == Urgency::Expired
    }
}

pub fn project_countdown(end: DateTime<Utc>, now: DateTime<Utc>) -> Countdown {
    let remaining_ms = (end - now).num_milliseconds();
    Countdown {
        parts: TimeParts::from_ms(remaining_ms),
        urgency: Urgency::from_remaining_ms(remaining_ms),
        remaining_ms,
    }
}

/// Recomputes a countdown every `period` while it is held.
///
/// The task stops after publishing an expired countdown, and is aborted when
/// the ticker is dropped.
#[derive(Debug)]
pub struct CountdownTicker {
    rx: watch::Receiver<Countdown>,
    task: JoinHandle<()>,
}

impl CountdownTicker {
    pub fn spawn(end: DateTime<Utc>, period: Duration) -> Self {
        let (tx, rx) = watch::channel(project_countdown(end, Utc::now()));
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let current = project_countdown(end, Utc::now());
                if tx.send(current).is_err() || current.is_expired() {
                    break;
                }
            }
        });
        Self { rx, task }
    }

    pub fn current(&self) -> Countdown {
        *self.rx.borrow()
    }

    /// Wait for the next recomputation. Returns `None` once the ticker stopped.
    pub async fn changed(&mut self) -> Option<Countdown> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for CountdownTicker {
    fn drop(&mut self) {
        self.task.abort();
    }
}
