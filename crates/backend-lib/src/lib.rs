// ============================
// roomchat-backend-lib/src/lib.rs
// ============================
//! Core backend-lib functionality for the room chat WebSocket server.

pub mod color;
pub mod config;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod metrics;
pub mod room;
pub mod router;
pub mod telemetry;
pub mod ws_router;

use std::sync::Arc;

use crate::config::Settings;
use crate::error::AppError;
use crate::identity::IdentityRegistry;
use crate::lifecycle::ConnectionManager;
use crate::room::RoomDirectory;
use crate::router::BroadcastRouter;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Settings the server was started with
    pub settings: Arc<Settings>,
    /// Connection → identity bindings
    pub registry: IdentityRegistry,
    /// The single shared room
    pub room: Arc<RoomDirectory>,
    /// Fan-out to the room
    pub router: BroadcastRouter,
    /// Live connections
    pub connections: ConnectionManager,
}

impl AppState {
    /// Create a new application state
    pub fn new(settings: Settings) -> Result<Self, AppError> {
        settings.validate()?;

        let registry = IdentityRegistry::new(settings.max_name_len);
        let room = Arc::new(RoomDirectory::new(settings.room_name.clone()));
        let router = BroadcastRouter::new(Arc::clone(&room), settings.send_timeout());
        let connections = ConnectionManager::new(registry.clone(), router.clone());

        Ok(Self {
            settings: Arc::new(settings),
            registry,
            room,
            router,
            connections,
        })
    }

    /// Create a new application state with default settings
    pub fn new_default() -> Result<Self, AppError> {
        Self::new(Settings::default())
    }
}
