use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::amqp_client::OutboundMessage;
use super::connection::ConnectionManager;
use super::errors::PublishError;
use crate::config::DeliverySettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    /// Delivery mode 2, survives a broker restart on a durable queue.
    pub persistent: bool,
    /// Wait for the broker's publisher confirm before returning.
    pub confirm_delivery: bool,
    /// Reuse an id to make the publish idempotent downstream.
    pub message_id: Option<String>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            persistent: true,
            confirm_delivery: true,
            message_id: None,
        }
    }
}

impl PublishOptions {
    pub fn from_settings(settings: &DeliverySettings) -> Self {
        Self {
            confirm_delivery: settings.confirm_delivery,
            ..Self::default()
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn transient(mut self) -> Self {
        self.persistent = false;
        self
    }

    pub fn without_confirm(mut self) -> Self {
        self.confirm_delivery = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishResult {
    pub message_id: String,
    pub destination: String,
    /// The broker confirmed the message. Always `false` without confirms.
    pub confirmed: bool,
}

/// Publishes to queues through the default exchange.
///
/// Publishes are never retried here: a failed publish is reported and the
/// caller decides whether to send again with the same message id.
pub struct Publisher {
    connections: Arc<ConnectionManager>,
}

impl Publisher {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }

    pub async fn publish(
        &self,
        destination: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<PublishResult, PublishError> {
        let connection = self.connections.connect().await?;

        let message = OutboundMessage {
            id: options
                .message_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            destination: destination.to_string(),
            payload: payload.to_vec(),
            persistent: options.persistent,
            attempt: 1,
            enqueued_at: Utc::now(),
        };

        let pending = connection.channel().publish(&message).await?;
        let confirmed = if options.confirm_delivery {
            if let Err(err) = pending.await {
                warn!(destination, message_id = %message.id, "Publish not confirmed: {}", err);
                return Err(err);
            }
            true
        } else {
            false
        };

        debug!(destination, message_id = %message.id, confirmed, "Published message");
        Ok(PublishResult {
            message_id: message.id,
            destination: message.destination,
            confirmed,
        })
    }

    /// Serializes `value` as JSON and publishes it.
    pub async fn publish_json<T: Serialize>(
        &self,
        destination: &str,
        value: &T,
        options: &PublishOptions,
    ) -> Result<PublishResult, PublishError> {
        let payload = serde_json::to_vec(value)?;
        self.publish(destination, &payload, options).await
    }
}
