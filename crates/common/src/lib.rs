// ================
// common/src/lib.rs
// ================
//! Common types and structures
//! used for communication between room chat clients and the server.
//! This module defines the WebSocket protocol events and supporting types.

use serde::{Deserialize, Serialize};

/// Name of the single room every connection shares.
pub const MAIN_ROOM: &str = "main_room";

/// Events sent from client to server
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Announce presence in the room
    /// # Fields
    /// * `username` - Display name the connection claims
    Join { username: String },
    /// Announce departure from the room
    /// # Fields
    /// * `username` - Display name the client believes it is bound to
    Leave { username: String },
    /// Broadcast a chat line to the room
    /// # Fields
    /// * `username` - Display name the client believes it is bound to
    /// * `message` - Chat text
    Message { username: String, message: String },
}

impl ClientEvent {
    /// The `username` field carried by every inbound event.
    pub fn username(&self) -> &str {
        match self {
            ClientEvent::Join { username }
            | ClientEvent::Leave { username }
            | ClientEvent::Message { username, .. } => username,
        }
    }

    /// Short name used in logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::Join { .. } => "join",
            ClientEvent::Leave { .. } => "leave",
            ClientEvent::Message { .. } => "message",
        }
    }
}

/// Structured chat line relayed to the whole room
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChatPayload {
    /// Sender's display name
    pub username: String,
    /// Chat text, relayed verbatim
    pub message: String,
    /// `#RRGGBB` color derived from the sender's name
    pub color: String,
}

/// Events sent from server to client.
///
/// Presence notices go out as a bare JSON string, chat lines as an object,
/// so clients tell them apart by JSON type alone.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum ServerEvent {
    /// Human readable join/leave notice
    Presence(String),
    /// Chat line
    Chat(ChatPayload),
}

/// Snapshot of the room as reported by `GET /members`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MembersSnapshot {
    /// Room name
    pub room: String,
    /// Present identities, sorted
    pub members: Vec<String>,
}

/// Body of `POST /logout`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LogoutRequest {
    pub username: String,
}
