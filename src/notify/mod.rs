//! Notification read-state reconciliation across push and REST.
//!
//! The unread view is only ever rebuilt from server snapshots (list refreshes
//! and push confirmations). The [`PendingReadLedger`] suppresses duplicate
//! submissions; it never marks anything read on its own.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::audience::{is_visible, ViewerContext};
use crate::error::EngineError;
use crate::model::NotificationDelivery;
use crate::portal::NotificationApi;
use crate::window::{LifecycleState, Window};

pub mod channel;
pub mod ledger;

pub use channel::{DeliveryChannel, PollChannel, PushChannel, PushCommand, PushEvent, PushLink};
pub use ledger::{PendingReadLedger, PendingState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkReadOutcome {
    /// Accepted by the named channel.
    Marked { via: &'static str },
    /// The latest server state already shows it read.
    AlreadyRead,
    /// A submission for this id is already running; nothing was sent.
    Pending,
    /// The consumer detached before the result arrived.
    Discarded,
}

#[derive(Debug, Default)]
struct Inbox {
    deliveries: Vec<NotificationDelivery>,
    ledger: PendingReadLedger,
    epoch: u64,
    refreshed_at: Option<DateTime<Utc>>,
}

impl Inbox {
    fn find(&self, id: &str) -> Option<&NotificationDelivery> {
        self.deliveries.iter().find(|d| d.notification.id == id)
    }

    fn is_read(&self, id: &str) -> bool {
        self.find(id).is_some_and(|d| d.is_read)
    }

    fn apply_snapshot(&mut self, snapshot: Vec<NotificationDelivery>) {
        let mut previous: HashMap<String, NotificationDelivery> = self
            .deliveries
            .drain(..)
            .map(|d| (d.notification.id.clone(), d))
            .collect();
        self.deliveries = snapshot
            .into_iter()
            .map(|incoming| match previous.remove(&incoming.notification.id) {
                Some(mut known) => {
                    known.merge_from(incoming);
                    known
                }
                None => incoming,
            })
            .collect();
        self.refreshed_at = Some(Utc::now());

        // A read row confirms any pending entry. A missing row only settles
        // one whose submission already finished.
        let deliveries = &self.deliveries;
        let released = self.ledger.release_confirmed(|id, state| {
            match deliveries.iter().find(|d| d.notification.id == id) {
                Some(d) => d.is_read,
                None => state == PendingState::AwaitingConfirmation,
            }
        });
        if released > 0 {
            debug!(released, "pending mark-reads confirmed by refresh");
        }
    }
}

pub struct Reconciler {
    push: Arc<dyn DeliveryChannel>,
    fallback: Arc<dyn DeliveryChannel>,
    api: Arc<dyn NotificationApi>,
    inbox: Mutex<Inbox>,
}

impl Reconciler {
    pub fn new(
        push: Arc<dyn DeliveryChannel>,
        fallback: Arc<dyn DeliveryChannel>,
        api: Arc<dyn NotificationApi>,
    ) -> Self {
        Self {
            push,
            fallback,
            api,
            inbox: Mutex::new(Inbox::default()),
        }
    }

    /// Push channel in front of the REST fallback built from the same API.
    pub fn with_rest_fallback(push: Arc<dyn DeliveryChannel>, api: Arc<dyn NotificationApi>) -> Self {
        let fallback = Arc::new(PollChannel::new(Arc::clone(&api)));
        Self::new(push, fallback, api)
    }

    fn lock(&self) -> MutexGuard<'_, Inbox> {
        self.inbox.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn pending(&self, id: &str) -> Option<PendingState> {
        self.lock().ledger.state(id)
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.lock().refreshed_at
    }

    /// Latest confirmed server state, unfiltered.
    pub fn snapshot(&self) -> Vec<NotificationDelivery> {
        self.lock().deliveries.clone()
    }

    pub fn unread(&self, viewer: &ViewerContext, now: DateTime<Utc>) -> Vec<NotificationDelivery> {
        self.lock()
            .deliveries
            .iter()
            .filter(|d| !d.is_read)
            .filter(|d| Window::of(*d).state_at(now) == LifecycleState::Active)
            .filter(|d| is_visible(*d, viewer))
            .cloned()
            .collect()
    }

    pub fn unread_count(&self, viewer: &ViewerContext, now: DateTime<Utc>) -> usize {
        self.unread(viewer, now).len()
    }

    /// Reload the list from the server.
    #[instrument(skip_all)]
    pub async fn refresh(&self) -> Result<()> {
        let epoch = self.lock().epoch;
        let snapshot = self.api.list_notifications().await?;
        let mut inbox = self.lock();
        if inbox.epoch != epoch {
            debug!("discarding refresh for detached consumer");
            return Ok(());
        }
        inbox.apply_snapshot(snapshot);
        Ok(())
    }

    /// A read confirmation pushed by the server, possibly from another device.
    pub fn apply_push_event(&self, event: &PushEvent) {
        let PushEvent::Read { id, read_at } = event else {
            return;
        };
        let mut inbox = self.lock();
        if let Some(delivery) = inbox.deliveries.iter_mut().find(|d| &d.notification.id == id) {
            delivery.mark_read_at(*read_at);
        }
        if inbox.ledger.release(id) {
            debug!(%id, "pending mark-read confirmed by push");
        }
    }

    /// Forget in-flight work; late results are dropped on arrival.
    ///
    /// Clearing the ledger gives up per-id serialization for submissions
    /// still running, so a re-attached consumer may send the same id again.
    pub fn detach(&self) {
        let mut inbox = self.lock();
        inbox.epoch += 1;
        inbox.ledger.clear();
    }

    #[instrument(skip(self))]
    pub async fn mark_read(&self, id: &str) -> Result<MarkReadOutcome, EngineError> {
        let epoch = {
            let mut inbox = self.lock();
            if inbox.is_read(id) {
                return Ok(MarkReadOutcome::AlreadyRead);
            }
            if !inbox.ledger.try_begin(id) {
                debug!("duplicate mark-read suppressed");
                return Ok(MarkReadOutcome::Pending);
            }
            inbox.epoch
        };
        let mut in_flight = InFlightGuard {
            reconciler: self,
            id,
            epoch,
            armed: true,
        };

        let via = match self.submit(id).await {
            Ok(via) => via,
            Err(err) => {
                warn!(%err, "mark-read failed on every channel");
                return Err(err);
            }
        };

        let refreshed = self.api.list_notifications().await;
        in_flight.armed = false;
        let mut inbox = self.lock();
        if inbox.epoch != epoch {
            return Ok(MarkReadOutcome::Discarded);
        }
        inbox.ledger.await_confirmation(id);
        match refreshed {
            Ok(snapshot) => inbox.apply_snapshot(snapshot),
            Err(err) => warn!(?err, "refresh after mark-read failed; awaiting confirmation"),
        }
        info!(via, "notification marked read");
        Ok(MarkReadOutcome::Marked { via })
    }

    async fn submit(&self, id: &str) -> Result<&'static str, EngineError> {
        let mut push_failure = None;
        if self.push.is_connected() {
            match self.push.mark_read(id).await {
                Ok(()) => return Ok(self.push.name()),
                Err(err) => {
                    warn!(%err, "push mark-read failed; falling back");
                    push_failure = Some(err.to_string());
                }
            }
        } else {
            debug!(
                reason = %EngineError::ChannelUnavailable(self.push.name()),
                "using fallback channel"
            );
        }
        match self.fallback.mark_read(id).await {
            Ok(()) => Ok(self.fallback.name()),
            Err(err) => Err(EngineError::MarkReadFailed {
                id: id.to_string(),
                push: push_failure,
                fallback: err.to_string(),
            }),
        }
    }

    /// Refresh on a fixed cadence until the returned handle is dropped.
    pub fn spawn_poller(self: &Arc<Self>, interval: Duration) -> TaskGuard {
        let this = Arc::clone(self);
        TaskGuard(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = this.refresh().await {
                    warn!(?err, "notification poll failed");
                }
            }
        }))
    }

    /// Apply push confirmations as they arrive until the handle is dropped.
    pub fn spawn_push_listener(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<PushEvent>,
    ) -> TaskGuard {
        let this = Arc::clone(self);
        TaskGuard(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => this.apply_push_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "push listener lagged; refreshing");
                        if let Err(err) = this.refresh().await {
                            warn!(?err, "refresh after lag failed");
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }))
    }
}

/// Releases an id still marked in flight when its submission ends early,
/// whether by error or by the caller dropping the future.
struct InFlightGuard<'a> {
    reconciler: &'a Reconciler,
    id: &'a str,
    epoch: u64,
    armed: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inbox = self.reconciler.lock();
        if inbox.epoch == self.epoch && inbox.ledger.state(self.id) == Some(PendingState::InFlight) {
            inbox.ledger.release(self.id);
        }
    }
}

/// Aborts the background task when dropped.
#[derive(Debug)]
pub struct TaskGuard(JoinHandle<()>);

impl TaskGuard {
    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}
