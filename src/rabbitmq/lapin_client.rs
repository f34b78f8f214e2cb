// src/rabbitmq/lapin_client.rs

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt};
use lapin::{
    message::Delivery,
    options::*,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, info, warn};

use super::amqp_client::{
    AmqpChannel, AmqpConnector, AmqpSession, DeliveryAcker, DeliveryStream, DisconnectCallback,
    InboundDelivery, OutboundMessage, PendingConfirm, QueueSpec,
};
use super::errors::{ConnectionError, PublishError, SerializationError};
use crate::message::{decode_attempt, Message, ATTEMPT_HEADER, DELIVERY_COUNT_HEADER};

const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Connects to RabbitMQ through lapin.
#[derive(Debug, Default, Clone)]
pub struct LapinConnector;

#[async_trait]
impl AmqpConnector for LapinConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn AmqpSession>, ConnectionError> {
        let connection = Connection::connect(uri, ConnectionProperties::default()).await?;
        info!("Connected to RabbitMQ");
        Ok(Arc::new(LapinSession { connection }))
    }
}

struct LapinSession {
    connection: Connection,
}

#[async_trait]
impl AmqpSession for LapinSession {
    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    fn on_disconnect(&self, callback: DisconnectCallback) {
        self.connection.on_error(move |err| callback(err.to_string()));
    }

    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, ConnectionError> {
        let channel = self.connection.create_channel().await?;
        // Confirms are requested per publish; the channel always runs in confirm mode.
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| ConnectionError::Channel(format!("Failed to enable confirm mode: {}", e)))?;
        debug!(channel_id = channel.id(), "Channel opened in confirm mode");
        Ok(Arc::new(LapinChannel { channel }))
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        if self.connection.status().connected() {
            self.connection.close(200, "Closing connection").await?;
        }
        Ok(())
    }
}

struct LapinChannel {
    channel: Channel,
}

fn publish_error(channel: &Channel, error: lapin::Error) -> PublishError {
    if channel.status().connected() {
        PublishError::Channel(error.to_string())
    } else {
        PublishError::ConnectionLost
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), ConnectionError> {
        let options = QueueDeclareOptions {
            durable: spec.durable,
            ..QueueDeclareOptions::default()
        };

        let mut args = FieldTable::default();
        if let Some(dlq) = &spec.dead_letter_queue {
            self.channel
                .queue_declare(dlq, options, FieldTable::default())
                .await
                .map_err(|e| ConnectionError::Channel(format!("Failed to declare queue {}: {}", dlq, e)))?;

            // Default exchange routes by queue name.
            args.insert("x-dead-letter-exchange".into(), AMQPValue::LongString("".into()));
            args.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(dlq.clone().into()),
            );
        }

        let queue = self
            .channel
            .queue_declare(&spec.name, options, args)
            .await
            .map_err(|e| ConnectionError::Channel(format!("Failed to declare queue {}: {}", spec.name, e)))?;

        info!(
            queue = %spec.name,
            dead_letter = ?spec.dead_letter_queue,
            "Queue declared with {} messages",
            queue.message_count()
        );
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, ConnectionError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|e| ConnectionError::Channel(format!("Failed to set QoS: {}", e)))?;

        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        let queue = queue.to_string();
        let stream = consumer.map(move |delivery| {
            delivery
                .map(|delivery| decode_delivery(&queue, delivery))
                .map_err(ConnectionError::from)
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), ConnectionError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<PendingConfirm, PublishError> {
        let confirm = self
            .channel
            .basic_publish(
                "",
                &message.destination,
                BasicPublishOptions::default(),
                &message.payload,
                outbound_properties(message),
            )
            .await
            .map_err(|e| publish_error(&self.channel, e))?;

        let channel = self.channel.clone();
        let destination = message.destination.clone();
        let message_id = message.id.clone();
        Ok(async move {
            let confirmation = confirm.await.map_err(|e| publish_error(&channel, e))?;
            if confirmation.is_nack() {
                warn!(message_id = %message_id, destination = %destination, "Publisher confirm NACK");
                return Err(PublishError::Nacked {
                    destination,
                    message_id,
                });
            }
            Ok(())
        }
        .boxed())
    }
}

struct LapinAcker {
    delivery: Delivery,
}

#[async_trait]
impl DeliveryAcker for LapinAcker {
    async fn ack(&self) -> Result<(), ConnectionError> {
        self.delivery
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(ConnectionError::from)
    }

    async fn nack(&self, requeue: bool) -> Result<(), ConnectionError> {
        self.delivery
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map(|_| ())
            .map_err(ConnectionError::from)
    }
}

fn outbound_properties(message: &OutboundMessage) -> BasicProperties {
    let mut headers = FieldTable::default();
    headers.insert(
        ATTEMPT_HEADER.into(),
        AMQPValue::LongLongInt(i64::from(message.attempt)),
    );

    let properties = BasicProperties::default()
        .with_message_id(message.id.clone().into())
        .with_timestamp(message.enqueued_at.timestamp().max(0) as u64)
        .with_headers(headers);

    if message.persistent {
        properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE)
    } else {
        properties
    }
}

fn decode_delivery(queue: &str, mut delivery: Delivery) -> InboundDelivery {
    let redelivered = delivery.redelivered;
    let payload = std::mem::take(&mut delivery.data);
    let message = decode_message(queue, &delivery.properties, payload, redelivered);

    InboundDelivery {
        message,
        redelivered,
        acker: Box::new(LapinAcker { delivery }),
    }
}

fn decode_message(
    queue: &str,
    properties: &BasicProperties,
    payload: Vec<u8>,
    redelivered: bool,
) -> Result<Message, SerializationError> {
    let id = properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string())
        .filter(|id| !id.is_empty())
        .ok_or(SerializationError::MissingMessageId)?;

    let headers = properties.headers().as_ref();
    let attempt = header_u32(headers, ATTEMPT_HEADER)?;
    let delivery_count = header_u32(headers, DELIVERY_COUNT_HEADER)?;

    let enqueued_at = (*properties.timestamp())
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts as i64, 0))
        .unwrap_or_else(Utc::now);

    Ok(Message {
        id,
        payload,
        destination: queue.to_string(),
        attempt: decode_attempt(attempt, delivery_count, redelivered),
        enqueued_at,
    })
}

fn header_u32(headers: Option<&FieldTable>, name: &str) -> Result<Option<u32>, SerializationError> {
    let value = match headers.and_then(|table| {
        table
            .inner()
            .iter()
            .find(|(key, _)| key.as_str() == name)
            .map(|(_, value)| value)
    }) {
        Some(value) => value,
        None => return Ok(None),
    };

    let invalid = |reason: String| SerializationError::InvalidHeader {
        name: name.to_string(),
        reason,
    };

    let number = match value {
        AMQPValue::ShortShortInt(v) => i64::from(*v),
        AMQPValue::ShortShortUInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        AMQPValue::ShortUInt(v) => i64::from(*v),
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::LongLongInt(v) => *v,
        other => return Err(invalid(format!("expected an integer, got {:?}", other))),
    };

    u32::try_from(number)
        .map(Some)
        .map_err(|_| invalid(format!("{} is out of range", number)))
}
