use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use super::amqp_client::{AmqpChannel, DeliveryAcker, DeliveryStream, OutboundMessage, PendingConfirm, QueueSpec};
use super::errors::{ConnectionError, PublishError};
use crate::message::Acknowledgement;

/// The process-wide channel shared by every consumer and publisher.
///
/// Broker client channels are not safe for interleaved commands, so every
/// channel level operation (declare, qos + consume, publish, ack/nack,
/// cancel) runs behind one async lock. Waiting for a publisher confirm and
/// running handlers happen outside of it.
pub struct ChannelManager {
    channel: Arc<dyn AmqpChannel>,
    ops: Mutex<()>,
    generation: u64,
}

impl ChannelManager {
    pub fn new(channel: Arc<dyn AmqpChannel>, generation: u64) -> Self {
        debug!(generation, "Creating channel manager");
        Self {
            channel,
            ops: Mutex::new(()),
            generation,
        }
    }

    /// Generation of the connection this channel belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    pub async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), ConnectionError> {
        let _guard = self.ops.lock().await;
        self.channel.declare_queue(spec).await
    }

    /// QoS and consume run under the same lock so the prefetch limit applies
    /// to this consumer and not one registered concurrently.
    pub async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, ConnectionError> {
        let _guard = self.ops.lock().await;
        self.channel.consume(queue, prefetch, consumer_tag).await
    }

    pub async fn cancel(&self, consumer_tag: &str) -> Result<(), ConnectionError> {
        let _guard = self.ops.lock().await;
        self.channel.cancel(consumer_tag).await
    }

    pub async fn publish(&self, message: &OutboundMessage) -> Result<PendingConfirm, PublishError> {
        let _guard = self.ops.lock().await;
        self.channel.publish(message).await
    }

    /// Reports an acknowledgement outcome to the broker.
    pub async fn settle(
        &self,
        acker: &dyn DeliveryAcker,
        outcome: Acknowledgement,
    ) -> Result<(), ConnectionError> {
        let _guard = self.ops.lock().await;
        match outcome {
            Acknowledgement::Ack => acker.ack().await,
            Acknowledgement::NackRequeue => acker.nack(true).await,
            Acknowledgement::NackDeadLetter => acker.nack(false).await,
        }
    }
}
