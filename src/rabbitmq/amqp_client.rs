// src/rabbitmq/amqp_client.rs
//
// Broker seam. The delivery core only talks to these traits; `lapin_client`
// implements them against a real broker and `memory` in-process.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::BoxStream;

use super::errors::{ConnectionError, PublishError, SerializationError};
use crate::message::Message;

pub type DisconnectCallback = Box<dyn Fn(String) + Send + Sync>;

pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, ConnectionError>>;

/// Resolves once the broker confirmed (or rejected) a published message.
/// Dropping it makes the publish fire-and-forget.
pub type PendingConfirm = BoxFuture<'static, Result<(), PublishError>>;

/// Opens sessions to a broker.
#[async_trait]
pub trait AmqpConnector: Send + Sync + 'static {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn AmqpSession>, ConnectionError>;
}

/// One established broker connection.
#[async_trait]
pub trait AmqpSession: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Invoked once with the reason when the session drops unexpectedly.
    fn on_disconnect(&self, callback: DisconnectCallback);

    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, ConnectionError>;

    async fn close(&self) -> Result<(), ConnectionError>;
}

/// Channel level operations. Callers serialize access (see `ChannelManager`).
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// False once the broker closed the channel, even if the session is up.
    fn is_open(&self) -> bool;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), ConnectionError>;

    /// Starts a manual-ack consumer bounded to `prefetch` unacknowledged messages.
    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, ConnectionError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), ConnectionError>;

    /// Sends a message to the queue named by `message.destination`.
    async fn publish(&self, message: &OutboundMessage) -> Result<PendingConfirm, PublishError>;
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<(), ConnectionError>;

    async fn nack(&self, requeue: bool) -> Result<(), ConnectionError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub dead_letter_queue: Option<String>,
}

impl QueueSpec {
    pub fn durable(name: &str) -> Self {
        Self {
            name: name.to_string(),
            durable: true,
            dead_letter_queue: None,
        }
    }

    pub fn with_dead_letter(mut self, dead_letter_queue: Option<String>) -> Self {
        self.dead_letter_queue = dead_letter_queue;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub id: String,
    pub destination: String,
    pub payload: Vec<u8>,
    pub persistent: bool,
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// A delivery as handed over by the transport. `message` is an error when
/// the envelope could not be interpreted.
pub struct InboundDelivery {
    pub message: Result<Message, SerializationError>,
    pub redelivered: bool,
    pub acker: Box<dyn DeliveryAcker>,
}

impl std::fmt::Debug for InboundDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundDelivery")
            .field("message", &self.message)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}
