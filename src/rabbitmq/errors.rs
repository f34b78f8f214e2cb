// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use std::time::Duration;
use thiserror::Error;
use tokio::time::error::Elapsed;

/// Transport level failures. Recovered by the reconnect loop, fatal only
/// once the connect ceiling is passed.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("RabbitMQ connection error: {0}")]
    Connect(String),

    #[error("RabbitMQ channel error: {0}")]
    Channel(String),

    #[error("No active connection")]
    NotConnected,

    #[error("Connection manager has been shut down")]
    Shutdown,

    #[error("Gave up connecting to RabbitMQ after {0:?}")]
    GaveUp(Duration),
}

impl ConnectionError {
    /// Fatal errors end the reconnect loop and surface to the process owner.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectionError::Shutdown | ConnectionError::GaveUp(_))
    }
}

impl From<LapinError> for ConnectionError {
    fn from(error: LapinError) -> Self {
        match &error {
            LapinError::InvalidChannelState(_) | LapinError::ChannelsLimitReached => {
                ConnectionError::Channel(error.to_string())
            }
            _ => ConnectionError::Connect(error.to_string()),
        }
    }
}

/// Publish failures are surfaced to the caller and never retried here.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Connection lost while publishing")]
    ConnectionLost,

    #[error("Broker rejected message {message_id} for '{destination}'")]
    Nacked {
        destination: String,
        message_id: String,
    },

    #[error("Message serialization error: {0}")]
    Serialization(#[from] SerdeError),

    #[error("RabbitMQ publish error: {0}")]
    Channel(String),
}

impl From<ConnectionError> for PublishError {
    fn from(error: ConnectionError) -> Self {
        match error {
            ConnectionError::Channel(reason) => PublishError::Channel(reason),
            _ => PublishError::ConnectionLost,
        }
    }
}

/// Returned by message handlers. Caught per message by the coordinator.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Retrying may help (downstream unavailable, lock contention...).
    #[error("Transient handler failure: {0}")]
    Transient(String),

    /// Retrying cannot help; the message goes to the dead-letter queue.
    #[error("Permanent handler failure: {0}")]
    Permanent(String),

    #[error("Payload could not be decoded: {0}")]
    Serialization(#[from] SerdeError),
}

impl HandlerError {
    pub fn transient(reason: impl ToString) -> Self {
        HandlerError::Transient(reason.to_string())
    }

    pub fn permanent(reason: impl ToString) -> Self {
        HandlerError::Permanent(reason.to_string())
    }

    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(error: anyhow::Error) -> Self {
        HandlerError::Transient(format!("{:#}", error))
    }
}

/// A delivery whose envelope cannot be interpreted. Always dead-lettered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SerializationError {
    #[error("Delivery carries no message id")]
    MissingMessageId,

    #[error("Invalid header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },
}

/// Startup configuration failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(String),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("No queue configured for channel '{0}'")]
    UnknownQueue(String),

    #[error("Failed to read config file {path}: {reason}")]
    File { path: String, reason: String },
}

impl ConfigError {
    pub fn invalid(key: &str, reason: impl ToString) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Operation timed out")]
    Timeout,
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl From<Elapsed> for RabbitMQError {
    fn from(_: Elapsed) -> Self {
        RabbitMQError::Timeout
    }
}
