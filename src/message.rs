use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::rabbitmq::errors::HandlerError;

/// Header carrying the attempt number of a published copy.
pub const ATTEMPT_HEADER: &str = "x-attempt";
/// Header maintained by RabbitMQ quorum queues on redelivery.
pub const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// Immutable envelope handed to message handlers.
///
/// `id` is stable across redeliveries of the same logical message, only
/// `attempt` changes between them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub payload: Vec<u8>,
    pub destination: String,
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl Message {
    pub fn new(id: impl Into<String>, destination: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Message {
            id: id.into(),
            payload: payload.into(),
            destination: destination.into(),
            attempt: 1,
            enqueued_at: Utc::now(),
        }
    }

    /// Copy of this message for another delivery attempt. Attempts start at 1.
    pub fn with_attempt(&self, attempt: u32) -> Self {
        Message {
            attempt: attempt.max(1),
            ..self.clone()
        }
    }

    pub fn with_enqueued_at(mut self, enqueued_at: DateTime<Utc>) -> Self {
        self.enqueued_at = enqueued_at;
        self
    }

    /// Decodes the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Outcome of processing one delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Acknowledgement {
    /// Processed, remove from the queue.
    Ack,
    /// Transient failure, redeliver.
    NackRequeue,
    /// Permanent failure or attempts exhausted, route to the dead-letter queue.
    NackDeadLetter,
}

impl Acknowledgement {
    pub fn is_ack(&self) -> bool {
        matches!(self, Acknowledgement::Ack)
    }
}

/// Attempt number of an incoming delivery, from whatever the broker kept.
///
/// A quorum queue delivery count wins over our own header; a redelivered
/// message with neither is at least on its second attempt.
pub fn decode_attempt(attempt_header: Option<u32>, delivery_count: Option<u32>, redelivered: bool) -> u32 {
    let from_headers = match (delivery_count, attempt_header) {
        (Some(count), _) => count.saturating_add(1),
        (None, Some(attempt)) => attempt.max(1),
        (None, None) => 1,
    };

    if redelivered && delivery_count.is_none() {
        from_headers.max(2)
    } else {
        from_headers
    }
}
