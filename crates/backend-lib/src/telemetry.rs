//! Tracing subscriber setup.
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, Settings};
use crate::error::AppError;

/// Install the global subscriber. `RUST_LOG` wins over `settings.log_level`.
pub fn init(settings: &Settings) -> Result<(), AppError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .map_err(|e| AppError::Config(format!("invalid log filter: {e}")))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let installed = match settings.log_format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };
    installed.map_err(|e| AppError::Internal(format!("tracing already initialised: {e}")))
}
