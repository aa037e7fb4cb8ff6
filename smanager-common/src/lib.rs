//! home-smanager Common Library
//!
//! This crate provides shared types and utilities for the energy exporter and
//! the device simulator:
//!
//! - [`reading`] - Energy reading data model (`Reading`, `LabelKey`)
//! - [`codec`] - Colon-delimited wire format (`decode`/`encode`)
//! - [`config`] - Configuration loading (JSON5 format)
//! - [`session`] - MQTT connection management
//! - [`error`] - Error types
//! - `test_utils` - Scripted loopback broker (`test-utils` feature)

pub mod codec;
pub mod config;
pub mod error;
pub mod reading;
pub mod session;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// Re-export commonly used types at the crate root
pub use codec::{DecodeError, decode, encode};
pub use config::{
    DEFAULT_TOPIC, LogFormat, LoggingConfig, MqttConfig, Qos, ReconnectConfig, load_config,
    parse_bool, parse_config,
};
pub use error::{ConnectError, Error, PublishError, Result, SubscribeError};
pub use reading::{LabelKey, Reading};
pub use session::{
    Connection, ConnectionEvent, ConnectionState, IncomingMessage, connect, next_client_id,
};

/// Initialize tracing with the given configuration.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
///
/// `RUST_LOG` takes precedence over `config.level` when set.
///
/// # Example
///
/// ```ignore
/// use smanager_common::{LoggingConfig, LogFormat, init_tracing};
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     format: LogFormat::Json,
/// };
/// init_tracing(&config)?;
/// ```
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}
