//! The two ways a mark-read can reach the server.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::debug;

use crate::error::ChannelError;
use crate::model::EntityId;
use crate::portal::NotificationApi;

#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_connected(&self) -> bool;

    async fn mark_read(&self, notification_id: &str) -> Result<(), ChannelError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushCommand {
    MarkRead { id: EntityId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    Read {
        id: EntityId,
        read_at: DateTime<Utc>,
    },
    Failed {
        id: EntityId,
        reason: String,
    },
}

/// Endpoints of a live socket task: commands out, confirmations in, and a
/// connection flag the socket keeps current.
#[derive(Debug, Clone)]
pub struct PushLink {
    pub commands: mpsc::Sender<PushCommand>,
    pub events: broadcast::Sender<PushEvent>,
    pub connected: watch::Receiver<bool>,
}

pub const PUSH_CHANNEL: &str = "push";
pub const REST_CHANNEL: &str = "rest";

#[derive(Debug, Clone)]
pub struct PushChannel {
    link: PushLink,
    ack_timeout: Duration,
}

impl PushChannel {
    pub fn new(link: PushLink, ack_timeout: Duration) -> Self {
        Self { link, ack_timeout }
    }

    /// A channel with no socket behind it; every call reports unavailable.
    pub fn disconnected() -> Self {
        let (commands, _) = mpsc::channel(1);
        let (events, _) = broadcast::channel(1);
        let (_, connected) = watch::channel(false);
        Self::new(
            PushLink {
                commands,
                events,
                connected,
            },
            Duration::from_secs(1),
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.link.events.subscribe()
    }
}

#[async_trait]
impl DeliveryChannel for PushChannel {
    fn name(&self) -> &'static str {
        PUSH_CHANNEL
    }

    fn is_connected(&self) -> bool {
        *self.link.connected.borrow() && !self.link.commands.is_closed()
    }

    async fn mark_read(&self, notification_id: &str) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::Unavailable(PUSH_CHANNEL));
        }
        // Subscribe before sending so the confirmation cannot be missed.
        let mut events = self.link.events.subscribe();
        self.link
            .commands
            .send(PushCommand::MarkRead {
                id: notification_id.to_string(),
            })
            .await
            .map_err(|_| ChannelError::Unavailable(PUSH_CHANNEL))?;

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(PushEvent::Read { id, .. }) if id == notification_id => return Ok(()),
                    Ok(PushEvent::Failed { id, reason }) if id == notification_id => {
                        return Err(ChannelError::Rejected {
                            channel: PUSH_CHANNEL,
                            reason,
                        })
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "push confirmations lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => return Err(ChannelError::Unavailable(PUSH_CHANNEL)),
                }
            }
        };
        tokio::time::timeout(self.ack_timeout, wait)
            .await
            .map_err(|_| ChannelError::Timeout(PUSH_CHANNEL))?
    }
}

/// Request/response fallback over the REST endpoint.
#[derive(Clone)]
pub struct PollChannel {
    api: Arc<dyn NotificationApi>,
}

impl PollChannel {
    pub fn new(api: Arc<dyn NotificationApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl DeliveryChannel for PollChannel {
    fn name(&self) -> &'static str {
        REST_CHANNEL
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn mark_read(&self, notification_id: &str) -> Result<(), ChannelError> {
        self.api
            .mark_read(notification_id)
            .await
            .map_err(|err| ChannelError::Rejected {
                channel: REST_CHANNEL,
                reason: format!("{err:#}"),
            })
    }
}
