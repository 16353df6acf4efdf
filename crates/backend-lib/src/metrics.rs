// ==============
// crates/backend-lib/src/metrics.rs

//! Central place for Prometheus metric keys
pub const WS_CONNECTION: &str = "ws.connection";
pub const WS_DISCONNECTION: &str = "ws.disconnection";
pub const WS_ACTIVE: &str = "ws.active";
pub const ROOM_JOINED: &str = "room.joined";
pub const ROOM_LEFT: &str = "room.left";
pub const ROOM_MEMBERS: &str = "room.members";
pub const CHAT_RELAYED: &str = "chat.relayed";
pub const EVENT_DROPPED: &str = "event.dropped";
pub const DELIVERY_DROPPED: &str = "delivery.dropped";
