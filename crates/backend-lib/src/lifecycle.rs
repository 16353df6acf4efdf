// ============================
// roomchat-backend-lib/src/lifecycle.rs
// ============================
//! Connection lifecycle: `Unbound → Bound → Terminated`.
//!
//! A connection's departure (explicit leave, logout, or transport drop) is
//! announced exactly once. Whichever path swaps the state to `Terminated`
//! first owns the departure; every later path sees `Terminated` and does
//! nothing.
//!
//! Broadcasts issued on behalf of one connection take its turn lock, so a
//! logout racing a join can never announce "left" before "entered".
use std::sync::Arc;

use dashmap::DashMap;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use roomchat_common::{ClientEvent, ServerEvent};
use tokio::sync::{mpsc, Mutex as TurnLock, Notify};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::AppError;
use crate::identity::{ConnectionId, Identity, IdentityRegistry};
use crate::metrics::{ROOM_JOINED, ROOM_LEFT, WS_ACTIVE};
use crate::router::{BroadcastRouter, DeliveryReport, Outbox};

/// Where a connection is in its lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Unbound,
    Bound { identity: Identity },
    Terminated,
}

/// What the transport should do after an event was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// One live client connection
pub struct Connection {
    id: ConnectionId,
    outbox: Outbox,
    state: Mutex<ConnectionState>,
    registry: IdentityRegistry,
    router: BroadcastRouter,
    closed: Notify,
    turn: TurnLock<()>,
}

impl Connection {
    fn new(id: ConnectionId, outbox: Outbox, registry: IdentityRegistry, router: BroadcastRouter) -> Self {
        Self {
            id,
            outbox,
            state: Mutex::new(ConnectionState::Unbound),
            registry,
            router,
            closed: Notify::new(),
            turn: TurnLock::new(()),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().clone()
    }

    /// Identity currently bound, if any
    pub fn identity(&self) -> Option<Identity> {
        match &*self.state.lock() {
            ConnectionState::Bound { identity } => Some(identity.clone()),
            _ => None,
        }
    }

    /// Resolves once the connection has been terminated from any path, or
    /// the router evicted it for not draining its queue
    pub async fn closed(&self) {
        tokio::select! {
            _ = self.closed.notified() => {},
            _ = self.outbox.evicted() => {
                debug!(connection = %self.id, "outbox evicted, closing");
            },
        }
    }

    /// Bind `name`, enter the room and announce it.
    ///
    /// Joining again under the bound name re-announces without changing
    /// membership.
    pub async fn join(&self, name: &str) -> Result<DeliveryReport, AppError> {
        let _turn = self.turn.lock().await;
        let identity = {
            let mut state = self.state.lock();
            let identity = match state.clone() {
                ConnectionState::Terminated => return Err(AppError::ConnectionTerminated),
                ConnectionState::Bound { identity } => {
                    if identity.as_str() != name {
                        return Err(AppError::IdentityConflict {
                            bound: identity.to_string(),
                            requested: name.to_string(),
                        });
                    }
                    identity
                },
                ConnectionState::Unbound => {
                    let identity = self.registry.bind(self.id, name)?;
                    *state = ConnectionState::Bound {
                        identity: identity.clone(),
                    };
                    identity
                },
            };
            self.router.room().enter(&identity, self.outbox.clone());
            identity
        };

        counter!(ROOM_JOINED).increment(1);
        info!(connection = %self.id, username = %identity, "joined room");
        Ok(self.router.announce_join(&identity).await)
    }

    /// Relay a chat line from the bound identity
    pub async fn message(&self, text: &str) -> Result<DeliveryReport, AppError> {
        let _turn = self.turn.lock().await;
        if *self.state.lock() == ConnectionState::Terminated {
            return Err(AppError::ConnectionTerminated);
        }
        let identity = self.registry.resolve(self.id)?;
        Ok(self.router.relay(&identity, text).await)
    }

    /// Explicit leave. Only valid once bound.
    pub async fn leave(&self) -> Result<DeliveryReport, AppError> {
        match &*self.state.lock() {
            ConnectionState::Unbound => return Err(AppError::NoIdentityBound),
            ConnectionState::Terminated => return Err(AppError::ConnectionTerminated),
            ConnectionState::Bound { .. } => {},
        }
        // A concurrent disconnect may still win the swap; then there is
        // nothing left to announce here.
        Ok(self.terminate().await.unwrap_or_default())
    }

    /// Transport went away. Announces departure if the connection was bound.
    pub async fn disconnect(&self) -> Option<DeliveryReport> {
        self.terminate().await
    }

    async fn terminate(&self) -> Option<DeliveryReport> {
        let _turn = self.turn.lock().await;
        let previous = std::mem::replace(&mut *self.state.lock(), ConnectionState::Terminated);
        if previous == ConnectionState::Terminated {
            return None;
        }
        self.closed.notify_one();
        self.registry.unbind(self.id);

        let ConnectionState::Bound { identity } = previous else {
            return None;
        };
        // Leave before announcing, so the departing connection is not
        // among the recipients of its own departure.
        if !self.router.room().exit(self.id, &identity) {
            debug!(connection = %self.id, username = %identity, "name still held by another connection");
        }
        counter!(ROOM_LEFT).increment(1);
        info!(connection = %self.id, username = %identity, "left room");
        Some(self.router.announce_leave(&identity).await)
    }

    /// Route one inbound event
    pub async fn dispatch(&self, event: ClientEvent) -> Result<Flow, AppError> {
        if let Some(bound) = self.identity() {
            if !matches!(event, ClientEvent::Join { .. }) && bound.as_str() != event.username() {
                debug!(
                    connection = %self.id,
                    bound = %bound,
                    claimed = event.username(),
                    "ignoring username in payload, using bound identity"
                );
            }
        }

        match event {
            ClientEvent::Join { username } => {
                self.join(&username).await?;
                Ok(Flow::Continue)
            },
            ClientEvent::Message { message, .. } => {
                self.message(&message).await?;
                Ok(Flow::Continue)
            },
            ClientEvent::Leave { .. } => {
                self.leave().await?;
                Ok(Flow::Close)
            },
        }
    }
}

/// Table of live connections
#[derive(Clone)]
pub struct ConnectionManager {
    connections: Arc<DashMap<ConnectionId, Arc<Connection>>>,
    registry: IdentityRegistry,
    router: BroadcastRouter,
}

impl ConnectionManager {
    pub fn new(registry: IdentityRegistry, router: BroadcastRouter) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            registry,
            router,
        }
    }

    /// Register a new, unbound connection that receives through `outbox`
    pub fn connect(&self, outbox: Outbox) -> Arc<Connection> {
        let id = outbox.connection_id();
        let connection = Arc::new(Connection::new(
            id,
            outbox,
            self.registry.clone(),
            self.router.clone(),
        ));
        self.connections.insert(id, Arc::clone(&connection));
        gauge!(WS_ACTIVE).set(self.connections.len() as f64);
        connection
    }

    /// Register a connection with a fresh id and its own outbound queue
    pub fn open(&self, capacity: usize) -> (Arc<Connection>, mpsc::Receiver<ServerEvent>) {
        let (outbox, rx) = Outbox::channel(Uuid::new_v4(), capacity);
        (self.connect(outbox), rx)
    }

    /// Tear down a connection after its transport closed
    pub async fn disconnect(&self, id: ConnectionId) -> Option<DeliveryReport> {
        let (_, connection) = self.connections.remove(&id)?;
        gauge!(WS_ACTIVE).set(self.connections.len() as f64);
        connection.disconnect().await
    }

    /// Live connections currently bound to `name`
    pub fn bound_to(&self, name: &str) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .identity()
                    .is_some_and(|identity| identity.as_str() == name)
            })
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// End every connection bound to `name`. Returns how many were ended,
    /// which is zero when nobody holds the name.
    pub async fn logout(&self, name: &str) -> Result<usize, AppError> {
        Identity::parse(name, self.registry.max_name_len())?;
        let mut ended = 0;
        for connection in self.bound_to(name) {
            if connection.leave().await.is_ok() {
                ended += 1;
            }
        }
        if ended == 0 {
            debug!(username = name, "logout for a name nobody holds");
        }
        Ok(ended)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::color_for;
    use crate::room::RoomDirectory;
    use roomchat_common::ChatPayload;
    use std::time::Duration;

    fn setup() -> (ConnectionManager, Arc<RoomDirectory>) {
        let room = Arc::new(RoomDirectory::new("main_room"));
        let router = BroadcastRouter::new(Arc::clone(&room), Duration::from_millis(50));
        (ConnectionManager::new(IdentityRegistry::new(80), router), room)
    }

    fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn presence(text: &str) -> ServerEvent {
        ServerEvent::Presence(text.to_string())
    }

    fn member_names(room: &RoomDirectory) -> Vec<String> {
        room.members().iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn test_join_binds_and_announces() {
        let (manager, room) = setup();
        let (c1, mut rx1) = manager.open(16);

        assert_eq!(c1.state(), ConnectionState::Unbound);
        let report = c1.join("alice").await.unwrap();
        assert_eq!(report.delivered, 1);
        assert!(matches!(c1.state(), ConnectionState::Bound { .. }));
        assert_eq!(member_names(&room), vec!["alice"]);
        assert_eq!(drain(&mut rx1), vec![presence("alice has entered the room.")]);
    }

    #[tokio::test]
    async fn test_chat_reaches_both_members() {
        let (manager, _room) = setup();
        let (c1, mut rx1) = manager.open(16);
        let (c2, mut rx2) = manager.open(16);
        c1.join("alice").await.unwrap();
        c2.join("bob").await.unwrap();
        drain(&mut rx1);
        drain(&mut rx2);

        c1.message("hi").await.unwrap();

        let expected = ServerEvent::Chat(ChatPayload {
            username: "alice".to_string(),
            message: "hi".to_string(),
            color: color_for("alice"),
        });
        assert_eq!(drain(&mut rx1), vec![expected.clone()]);
        assert_eq!(drain(&mut rx2), vec![expected]);
    }

    #[tokio::test]
    async fn test_disconnect_announces_departure_once() {
        let (manager, room) = setup();
        let (c1, _rx1) = manager.open(16);
        let (c2, mut rx2) = manager.open(16);
        c1.join("alice").await.unwrap();
        c2.join("bob").await.unwrap();
        drain(&mut rx2);

        assert!(manager.disconnect(c1.id()).await.is_some());
        assert!(c1.disconnect().await.is_none());
        assert!(manager.disconnect(c1.id()).await.is_none());

        assert_eq!(drain(&mut rx2), vec![presence("alice has left the room.")]);
        assert_eq!(member_names(&room), vec!["bob"]);
        assert_eq!(c1.state(), ConnectionState::Terminated);
    }

    #[tokio::test]
    async fn test_explicit_leave_then_disconnect_fires_once() {
        let (manager, room) = setup();
        let (c1, _rx1) = manager.open(16);
        let (c2, mut rx2) = manager.open(16);
        c1.join("alice").await.unwrap();
        c2.join("bob").await.unwrap();
        drain(&mut rx2);

        c1.leave().await.unwrap();
        assert!(manager.disconnect(c1.id()).await.is_none());
        assert!(matches!(c1.leave().await, Err(AppError::ConnectionTerminated)));

        assert_eq!(drain(&mut rx2), vec![presence("alice has left the room.")]);
        assert!(!room.contains(&Identity::parse("alice", 80).unwrap()));
    }

    #[tokio::test]
    async fn test_concurrent_leave_and_disconnect_fire_once() {
        let (manager, _room) = setup();
        let (c1, _rx1) = manager.open(16);
        let (c2, mut rx2) = manager.open(64);
        c2.join("bob").await.unwrap();
        c1.join("alice").await.unwrap();
        drain(&mut rx2);

        let leaver = Arc::clone(&c1);
        let manager_clone = manager.clone();
        let id = c1.id();
        let (left, disconnected) = tokio::join!(
            tokio::spawn(async move { leaver.leave().await.ok() }),
            tokio::spawn(async move { manager_clone.disconnect(id).await }),
        );
        left.unwrap();
        disconnected.unwrap();

        let departures = drain(&mut rx2)
            .into_iter()
            .filter(|e| *e == presence("alice has left the room."))
            .count();
        assert_eq!(departures, 1);
    }

    #[tokio::test]
    async fn test_unbound_message_is_dropped() {
        let (manager, room) = setup();
        let (c1, mut rx1) = manager.open(16);
        let (c2, mut rx2) = manager.open(16);
        c2.join("bob").await.unwrap();
        drain(&mut rx2);

        assert!(matches!(c1.message("hi").await, Err(AppError::NoIdentityBound)));
        assert!(drain(&mut rx1).is_empty());
        assert!(drain(&mut rx2).is_empty());
        assert_eq!(member_names(&room), vec!["bob"]);
    }

    #[tokio::test]
    async fn test_unbound_disconnect_does_not_touch_room() {
        let (manager, room) = setup();
        let (c1, _rx1) = manager.open(16);
        let (c2, mut rx2) = manager.open(16);
        c2.join("bob").await.unwrap();
        drain(&mut rx2);

        assert!(manager.disconnect(c1.id()).await.is_none());
        assert!(drain(&mut rx2).is_empty());
        assert_eq!(member_names(&room), vec!["bob"]);
    }

    #[tokio::test]
    async fn test_invalid_name_leaves_connection_unbound() {
        let (manager, room) = setup();
        let (c1, mut rx1) = manager.open(16);

        assert!(matches!(c1.join("").await, Err(AppError::InvalidIdentity(_))));
        assert_eq!(c1.state(), ConnectionState::Unbound);
        assert!(room.is_empty());
        assert!(drain(&mut rx1).is_empty());
    }

    #[tokio::test]
    async fn test_rejoin_reannounces_and_conflicting_name_is_rejected() {
        let (manager, room) = setup();
        let (c1, mut rx1) = manager.open(16);
        c1.join("alice").await.unwrap();
        c1.join("alice").await.unwrap();

        assert_eq!(
            drain(&mut rx1),
            vec![
                presence("alice has entered the room."),
                presence("alice has entered the room."),
            ]
        );
        assert_eq!(room.len(), 1);

        assert!(matches!(
            c1.join("mallory").await,
            Err(AppError::IdentityConflict { .. })
        ));
        assert_eq!(member_names(&room), vec!["alice"]);
    }

    #[tokio::test]
    async fn test_dispatch_uses_bound_identity() {
        let (manager, _room) = setup();
        let (c1, mut rx1) = manager.open(16);

        let flow = c1
            .dispatch(ClientEvent::Join {
                username: "alice".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(flow, Flow::Continue);

        c1.dispatch(ClientEvent::Message {
            username: "someone-else".to_string(),
            message: "hi".to_string(),
        })
        .await
        .unwrap();

        let events = drain(&mut rx1);
        let ServerEvent::Chat(payload) = &events[1] else {
            panic!("Expected chat payload");
        };
        assert_eq!(payload.username, "alice");

        let flow = c1
            .dispatch(ClientEvent::Leave {
                username: "alice".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(flow, Flow::Close);
    }

    #[tokio::test]
    async fn test_logout_ends_bound_connections() {
        let (manager, room) = setup();
        let (c1, _rx1) = manager.open(16);
        let (c2, mut rx2) = manager.open(16);
        c1.join("alice").await.unwrap();
        c2.join("bob").await.unwrap();
        drain(&mut rx2);

        assert_eq!(manager.logout("alice").await.unwrap(), 1);
        assert_eq!(c1.state(), ConnectionState::Terminated);
        assert_eq!(drain(&mut rx2), vec![presence("alice has left the room.")]);
        assert_eq!(member_names(&room), vec!["bob"]);

        // The worker notices through `closed()`.
        tokio::time::timeout(Duration::from_secs(1), c1.closed())
            .await
            .unwrap();

        // A second logout finds nobody and announces nothing.
        assert_eq!(manager.logout("alice").await.unwrap(), 0);
        assert_eq!(manager.logout("zed").await.unwrap(), 0);
        assert!(drain(&mut rx2).is_empty());
        assert!(matches!(
            manager.logout("").await,
            Err(AppError::InvalidIdentity(_))
        ));
    }

    #[tokio::test]
    async fn test_shared_name_survives_one_connection_leaving() {
        let (manager, room) = setup();
        let (c1, _rx1) = manager.open(16);
        let (c2, mut rx2) = manager.open(16);
        let (c3, mut rx3) = manager.open(16);
        c1.join("alice").await.unwrap();
        c2.join("alice").await.unwrap();
        c3.join("bob").await.unwrap();
        drain(&mut rx2);
        drain(&mut rx3);

        c1.leave().await.unwrap();
        assert_eq!(drain(&mut rx3), vec![presence("alice has left the room.")]);
        assert!(matches!(c2.state(), ConnectionState::Bound { .. }));
        assert_eq!(member_names(&room), vec!["alice", "bob"]);

        c2.message("still here").await.unwrap();
        let expected = ServerEvent::Chat(ChatPayload {
            username: "alice".to_string(),
            message: "still here".to_string(),
            color: color_for("alice"),
        });
        assert_eq!(drain(&mut rx2), vec![presence("alice has left the room."), expected.clone()]);
        assert_eq!(drain(&mut rx3), vec![expected]);

        manager.disconnect(c2.id()).await.unwrap();
        assert_eq!(member_names(&room), vec!["bob"]);
    }

    #[tokio::test]
    async fn test_logout_racing_join_announces_in_order() {
        for _ in 0..20 {
            let (manager, _room) = setup();
            let (watcher, mut watcher_rx) = manager.open(64);
            watcher.join("bob").await.unwrap();
            drain(&mut watcher_rx);

            let (c1, _rx1) = manager.open(16);
            let joiner = Arc::clone(&c1);
            let join = tokio::spawn(async move { joiner.join("alice").await });
            let logout = {
                let manager = manager.clone();
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    manager.logout("alice").await
                })
            };
            let _ = join.await.unwrap();
            logout.await.unwrap().unwrap();
            c1.disconnect().await;

            let events = drain(&mut watcher_rx);
            let entered = events
                .iter()
                .position(|e| *e == presence("alice has entered the room."));
            let left = events
                .iter()
                .position(|e| *e == presence("alice has left the room."));
            if let (Some(entered), Some(left)) = (entered, left) {
                assert!(entered < left);
            }
            // A departure is only ever announced after an arrival.
            assert!(left.is_none() || entered.is_some());
        }
    }

    #[tokio::test]
    async fn test_evicted_connection_is_told_to_close() {
        let (manager, room) = setup();
        let (slow, _slow_rx) = manager.open(1);
        let (c2, mut rx2) = manager.open(64);
        slow.join("slow").await.unwrap();
        c2.join("bob").await.unwrap();

        // `slow` never drains; its single slot is already taken.
        for n in 0..crate::router::MAX_STALLED_SENDS {
            c2.message(&n.to_string()).await.unwrap();
        }
        tokio::time::timeout(Duration::from_secs(1), slow.closed())
            .await
            .expect("evicted connection was not closed");

        manager.disconnect(slow.id()).await.unwrap();
        assert_eq!(member_names(&room), vec!["bob"]);
        let events = drain(&mut rx2);
        assert_eq!(events.last(), Some(&presence("slow has left the room.")));
    }
}
