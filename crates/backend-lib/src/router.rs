// ============================
// roomchat-backend-lib/src/router.rs
// ============================
//! Broadcast router: presence and chat fan-out to the room.
//!
//! Every event goes to every attached connection, the sender included.
//! Delivery is best-effort. A recipient whose queue is closed, or still full
//! once the send timeout expires, misses that event; nobody else does.
//!
//! A recipient that stays stalled for `MAX_STALLED_SENDS` broadcasts in a
//! row is evicted from the fan-out set and its connection is told to close,
//! so it stops slowing down everyone else.
//!
//! Callers await each broadcast before issuing the next one from the same
//! connection, which is what keeps per-sender order intact.
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use roomchat_common::{ChatPayload, ServerEvent};
use tokio::sync::mpsc::{
    self,
    error::{SendTimeoutError, TrySendError},
};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::color::color_for;
use crate::error::AppError;
use crate::identity::{ConnectionId, Identity};
use crate::metrics::{CHAT_RELAYED, DELIVERY_DROPPED};
use crate::room::RoomDirectory;

/// Consecutive timed-out sends after which a recipient is evicted
pub const MAX_STALLED_SENDS: u32 = 3;

#[derive(Debug, Default)]
struct Stall {
    consecutive: AtomicU32,
    evicted: Notify,
}

/// A connection's bounded outbound queue
#[derive(Debug, Clone)]
pub struct Outbox {
    connection_id: ConnectionId,
    tx: mpsc::Sender<ServerEvent>,
    stall: Arc<Stall>,
}

impl Outbox {
    pub fn new(connection_id: ConnectionId, tx: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            connection_id,
            tx,
            stall: Arc::new(Stall::default()),
        }
    }

    /// Create an outbox together with the receiving end its writer drains
    pub fn channel(
        connection_id: ConnectionId,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(connection_id, tx), rx)
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Queue `event` without waiting
    pub fn try_deliver(&self, event: ServerEvent) -> Result<(), TrySendError<ServerEvent>> {
        self.tx.try_send(event)?;
        self.stall.consecutive.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Queue `event`, waiting at most `timeout` for room in the queue
    pub async fn deliver(&self, event: ServerEvent, timeout: Duration) -> Result<(), AppError> {
        match self.tx.send_timeout(event, timeout).await {
            Ok(()) => {
                self.stall.consecutive.store(0, Ordering::Relaxed);
                Ok(())
            },
            Err(SendTimeoutError::Timeout(_)) => {
                self.stall.consecutive.fetch_add(1, Ordering::Relaxed);
                Err(AppError::DeliveryFailure(format!(
                    "queue still full after {}ms",
                    timeout.as_millis()
                )))
            },
            Err(SendTimeoutError::Closed(_)) => {
                Err(AppError::DeliveryFailure("connection closed".to_string()))
            },
        }
    }

    /// Timed-out sends since the last successful one
    pub fn stalled_sends(&self) -> u32 {
        self.stall.consecutive.load(Ordering::Relaxed)
    }

    fn mark_evicted(&self) {
        self.stall.evicted.notify_one();
    }

    /// Resolves once the router has given up on this outbox
    pub async fn evicted(&self) {
        self.stall.evicted.notified().await;
    }
}

/// Kind of presence change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceKind {
    Join,
    Leave,
}

/// A join or leave notice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEvent {
    pub identity: Identity,
    pub kind: PresenceKind,
}

impl PresenceEvent {
    /// Human readable text sent to the room
    pub fn text(&self) -> String {
        match self.kind {
            PresenceKind::Join => format!("{} has entered the room.", self.identity),
            PresenceKind::Leave => format!("{} has left the room.", self.identity),
        }
    }
}

impl From<PresenceEvent> for ServerEvent {
    fn from(event: PresenceEvent) -> Self {
        ServerEvent::Presence(event.text())
    }
}

/// A chat line stamped with its sender's color
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEvent {
    pub identity: Identity,
    pub text: String,
    pub color: String,
}

impl ChatEvent {
    pub fn new(identity: Identity, text: impl Into<String>) -> Self {
        let color = color_for(identity.as_str());
        Self {
            identity,
            text: text.into(),
            color,
        }
    }
}

impl From<ChatEvent> for ServerEvent {
    fn from(event: ChatEvent) -> Self {
        ServerEvent::Chat(ChatPayload {
            username: event.identity.to_string(),
            message: event.text,
            color: event.color,
        })
    }
}

/// Outcome of one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Recipients whose queue accepted the event
    pub delivered: usize,
    /// Recipients that missed the event
    pub dropped: usize,
}

/// Routes room events to every attached connection
#[derive(Clone)]
pub struct BroadcastRouter {
    room: Arc<RoomDirectory>,
    send_timeout: Duration,
}

impl BroadcastRouter {
    pub fn new(room: Arc<RoomDirectory>, send_timeout: Duration) -> Self {
        Self { room, send_timeout }
    }

    pub fn room(&self) -> &Arc<RoomDirectory> {
        &self.room
    }

    /// Tell the room `identity` arrived
    pub async fn announce_join(&self, identity: &Identity) -> DeliveryReport {
        let event = PresenceEvent {
            identity: identity.clone(),
            kind: PresenceKind::Join,
        };
        self.fan_out(event.into()).await
    }

    /// Tell the room `identity` left
    pub async fn announce_leave(&self, identity: &Identity) -> DeliveryReport {
        let event = PresenceEvent {
            identity: identity.clone(),
            kind: PresenceKind::Leave,
        };
        self.fan_out(event.into()).await
    }

    /// Relay a chat line from `identity` to the room
    pub async fn relay(&self, identity: &Identity, text: &str) -> DeliveryReport {
        let event = ChatEvent::new(identity.clone(), text);
        debug!(username = %identity, color = %event.color, "relaying chat message");
        let report = self.fan_out(event.into()).await;
        counter!(CHAT_RELAYED).increment(1);
        report
    }

    async fn fan_out(&self, event: ServerEvent) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let mut stalled = JoinSet::new();

        for outbox in self.room.recipients() {
            match outbox.try_deliver(event.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Closed(_)) => {
                    report.dropped += 1;
                    warn!(connection = %outbox.connection_id(), "dropping event for closed connection");
                },
                Err(TrySendError::Full(event)) => {
                    // Slow recipients wait in parallel, each up to the timeout.
                    let timeout = self.send_timeout;
                    stalled.spawn(async move {
                        let result = outbox.deliver(event, timeout).await;
                        (outbox, result)
                    });
                },
            }
        }

        while let Some(joined) = stalled.join_next().await {
            match joined {
                Ok((_, Ok(()))) => report.delivered += 1,
                Ok((outbox, Err(e))) => {
                    report.dropped += 1;
                    let connection = outbox.connection_id();
                    warn!(%connection, error = %e, "dropping event for stalled connection");
                    if outbox.stalled_sends() >= MAX_STALLED_SENDS && self.room.evict(connection) {
                        outbox.mark_evicted();
                        warn!(%connection, "evicting stalled connection from the room");
                    }
                },
                Err(e) => {
                    report.dropped += 1;
                    warn!(error = %e, "delivery task failed");
                },
            }
        }

        if report.dropped > 0 {
            counter!(DELIVERY_DROPPED).increment(report.dropped as u64);
        }
        report
    }
}
