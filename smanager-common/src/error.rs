use std::time::Duration;

use thiserror::Error;

use crate::codec::DecodeError;

/// Common error type for home-smanager components.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Subscribe(#[from] SubscribeError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using the common [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Failure to establish a broker session.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Invalid broker address: {0}")]
    InvalidAddress(String),

    #[error("Broker {broker} unreachable: {reason}")]
    Unreachable { broker: String, reason: String },

    #[error("Broker {broker} rejected the connection: {reason}")]
    Rejected { broker: String, reason: String },

    #[error("No CONNACK from {broker} within {timeout:?}")]
    Timeout { broker: String, timeout: Duration },
}

/// Failure to subscribe to a topic.
#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("Broker rejected subscription to {topic}")]
    Rejected { topic: String },

    #[error("No SUBACK within {0:?}")]
    AckTimeout(Duration),

    #[error("Connection closed")]
    Closed,
}

/// Failure to publish a message.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("No acknowledgement within {0:?}")]
    AckTimeout(Duration),

    #[error("Connection closed")]
    Closed,
}
