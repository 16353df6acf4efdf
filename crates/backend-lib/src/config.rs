// ============================
// roomchat-backend-lib/src/config.rs
// ============================
//! Configuration management.
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Default config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "roomchat.toml";

/// Prefix for environment overrides, e.g. `ROOMCHAT_BIND_ADDR`
pub const ENV_PREFIX: &str = "ROOMCHAT_";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Log level (or full `EnvFilter` directive)
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
    /// Name of the single shared room
    pub room_name: String,
    /// Longest accepted display name, in characters
    pub max_name_len: usize,
    /// Capacity of each connection's outbound queue
    pub outbound_queue: usize,
    /// How long fan-out waits on one full recipient queue, in milliseconds
    pub send_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            room_name: roomchat_common::MAIN_ROOM.to_string(),
            max_name_len: 80,
            outbound_queue: 64,
            send_timeout_ms: 250,
        }
    }
}

impl Settings {
    /// Load settings from defaults, `roomchat.toml` and the environment
    pub fn load() -> Result<Self, AppError> {
        Self::from_figment(Self::base_figment())
    }

    /// Load settings with an explicit config file layered over `roomchat.toml`
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(AppError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        let figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(DEFAULT_CONFIG_FILE))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX));
        Self::from_figment(figment)
    }

    fn base_figment() -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(DEFAULT_CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    fn from_figment(figment: Figment) -> Result<Self, AppError> {
        let settings: Settings = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the server cannot run with
    pub fn validate(&self) -> Result<(), AppError> {
        let level = self.log_level.to_ascii_lowercase();
        // Full filter directives ("info,backend_lib=debug") are passed through.
        if !level.contains('=') && !level.contains(',') && !VALID_LOG_LEVELS.contains(&level.as_str())
        {
            return Err(AppError::Config(format!("invalid log level: {}", self.log_level)));
        }
        if self.room_name.trim().is_empty() {
            return Err(AppError::Config("room_name must not be empty".to_string()));
        }
        if self.max_name_len == 0 {
            return Err(AppError::Config("max_name_len must be at least 1".to_string()));
        }
        if self.outbound_queue == 0 {
            return Err(AppError::Config("outbound_queue must be at least 1".to_string()));
        }
        if self.send_timeout_ms == 0 {
            return Err(AppError::Config("send_timeout_ms must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}
