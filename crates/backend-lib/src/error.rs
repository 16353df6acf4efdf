// crates/backend-lib/src/error.rs

//! Central error type + Axum integration.
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Application error types with error codes and context
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("No identity bound to this connection")]
    NoIdentityBound,

    #[error("Connection is already bound to '{bound}', cannot join as '{requested}'")]
    IdentityConflict { bound: String, requested: String },

    #[error("Connection already terminated")]
    ConnectionTerminated,

    #[error("Delivery failed: {0}")]
    DeliveryFailure(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AppError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidIdentity(_) | AppError::Json(_) => StatusCode::BAD_REQUEST,
            AppError::NoIdentityBound => StatusCode::UNAUTHORIZED,
            AppError::IdentityConflict { .. } => StatusCode::CONFLICT,
            AppError::ConnectionTerminated => StatusCode::GONE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::InvalidIdentity(_) => "ID_001",
            AppError::NoIdentityBound => "ID_002",
            AppError::IdentityConflict { .. } => "ID_003",
            AppError::ConnectionTerminated => "CONN_001",
            AppError::DeliveryFailure(_) => "DLV_001",
            AppError::Config(_) => "CFG_001",
            AppError::Internal(_) => "INT_001",
            AppError::Json(_) => "JSON_001",
        }
    }

    /// Get a sanitized message suitable for production use
    pub fn sanitized_message(&self) -> String {
        match self {
            AppError::InvalidIdentity(_) => "Invalid username".to_string(),
            AppError::NoIdentityBound => "Join the room first".to_string(),
            AppError::IdentityConflict { .. } => "Already joined under another name".to_string(),
            AppError::ConnectionTerminated => "Connection closed".to_string(),
            AppError::Json(_) => "Invalid request format".to_string(),
            AppError::DeliveryFailure(_) | AppError::Config(_) | AppError::Internal(_) => {
                "An internal server error occurred".to_string()
            },
        }
    }

    /// Whether the error comes from a client event the room simply ignores.
    /// Anything else points at the server and is worth a warning.
    pub fn is_dropped_event(&self) -> bool {
        matches!(
            self,
            AppError::InvalidIdentity(_)
                | AppError::NoIdentityBound
                | AppError::IdentityConflict { .. }
                | AppError::ConnectionTerminated
                | AppError::Json(_)
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();

        // Use detailed messages in development, sanitized in production
        let message = if cfg!(debug_assertions) {
            self.to_string()
        } else {
            self.sanitized_message()
        };

        let body = serde_json::json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<figment::Error> for AppError {
    fn from(err: figment::Error) -> Self {
        AppError::Config(err.to_string())
    }
}
