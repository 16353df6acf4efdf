// ============================
// roomchat-backend-lib/src/room.rs
// ============================
//! Room membership and the fan-out set.
//!
//! The directory keeps two views of the room behind one lock: the set of
//! present identities, and the outboxes of the connections that receive
//! room events. Every mutation of either goes through the same mutex, so a
//! snapshot always reflects one consistent instant.
use std::collections::{BTreeSet, HashMap, HashSet};

use metrics::gauge;
use parking_lot::Mutex;

use crate::identity::{ConnectionId, Identity};
use crate::metrics::ROOM_MEMBERS;
use crate::router::Outbox;

struct Recipient {
    identity: Identity,
    outbox: Outbox,
}

#[derive(Default)]
struct RoomState {
    members: HashSet<Identity>,
    recipients: HashMap<ConnectionId, Recipient>,
}

impl RoomState {
    fn add_member(&mut self, identity: &Identity) -> bool {
        let added = self.members.insert(identity.clone());
        gauge!(ROOM_MEMBERS).set(self.members.len() as f64);
        added
    }

    fn remove_member(&mut self, identity: &Identity) -> bool {
        let removed = self.members.remove(identity);
        gauge!(ROOM_MEMBERS).set(self.members.len() as f64);
        removed
    }

    fn claimed_by_recipient(&self, identity: &Identity) -> bool {
        self.recipients.values().any(|r| &r.identity == identity)
    }
}

/// Directory of the single shared room
pub struct RoomDirectory {
    name: String,
    state: Mutex<RoomState>,
}

impl RoomDirectory {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(RoomState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add `identity` to the room. Returns `false` if it was already present.
    pub fn join(&self, identity: &Identity) -> bool {
        self.state.lock().add_member(identity)
    }

    /// Remove `identity` from the room. Returns `false` if it was absent.
    pub fn leave(&self, identity: &Identity) -> bool {
        self.state.lock().remove_member(identity)
    }

    /// Snapshot of present identities
    pub fn members(&self) -> BTreeSet<Identity> {
        self.state.lock().members.iter().cloned().collect()
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.state.lock().members.contains(identity)
    }

    /// `join` plus start delivering room events to `outbox`, under one lock
    pub fn enter(&self, identity: &Identity, outbox: Outbox) -> bool {
        let mut state = self.state.lock();
        state.recipients.insert(
            outbox.connection_id(),
            Recipient {
                identity: identity.clone(),
                outbox,
            },
        );
        state.add_member(identity)
    }

    /// Stop delivering to `connection`, and `leave` unless another attached
    /// connection still claims `identity`. Returns whether the identity left.
    pub fn exit(&self, connection: ConnectionId, identity: &Identity) -> bool {
        let mut state = self.state.lock();
        state.recipients.remove(&connection);
        if state.claimed_by_recipient(identity) {
            return false;
        }
        state.remove_member(identity)
    }

    /// Stop delivering to `connection` without touching membership.
    /// The connection's own termination settles membership later.
    pub fn evict(&self, connection: ConnectionId) -> bool {
        self.state.lock().recipients.remove(&connection).is_some()
    }

    /// Outboxes of every attached connection, cloned out of the lock
    pub fn recipients(&self) -> Vec<Outbox> {
        self.state
            .lock()
            .recipients
            .values()
            .map(|r| r.outbox.clone())
            .collect()
    }

    /// Number of present identities
    pub fn len(&self) -> usize {
        self.state.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().members.is_empty()
    }
}
