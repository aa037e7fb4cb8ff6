//! Error types for the simulator.

use smanager_common::ConnectError;
use thiserror::Error;

/// Result type alias using [`SimulatorError`].
pub type Result<T> = std::result::Result<T, SimulatorError>;

/// Errors that can occur while setting up the simulator.
#[derive(Error, Debug)]
pub enum SimulatorError {
    /// Configuration file not found.
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration parse error.
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration validation error.
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    /// Broker connection error.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SimulatorError {
    /// Create a configuration validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ConfigValidation(msg.into())
    }
}

impl From<json5::Error> for SimulatorError {
    fn from(err: json5::Error) -> Self {
        Self::ConfigParse(err.to_string())
    }
}

impl From<smanager_common::Error> for SimulatorError {
    fn from(err: smanager_common::Error) -> Self {
        match err {
            smanager_common::Error::Connect(e) => Self::Connect(e),
            smanager_common::Error::Io(e) => Self::Io(e),
            other => Self::ConfigValidation(other.to_string()),
        }
    }
}
