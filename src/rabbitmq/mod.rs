// src/rabbitmq/mod.rs
// At-least-once delivery over RabbitMQ: connection, consumer, publisher
// and the coordinator deciding ack / requeue / dead-letter.

pub mod errors;
pub mod connection;
pub mod coordinator;
pub mod consumer;
pub mod publisher;
pub mod handler;

// Transport seam and its implementations
pub mod amqp_client;
pub mod lapin_client;
pub mod memory;
mod channel_manager;

pub use channel_manager::ChannelManager;
pub use connection::{BackoffPolicy, Connection, ConnectionManager, ConnectionState};
pub use consumer::{Consumer, SubscriptionHandle};
pub use coordinator::{DeliveryCoordinator, DeliveryRecord, DeliveryState};
pub use errors::{
    ConfigError, ConnectionError, HandlerError, PublishError, RabbitMQError, Result, SerializationError,
};
pub use handler::{handler_fn, MessageHandler};
pub use memory::MemoryBroker;
pub use publisher::{PublishOptions, PublishResult, Publisher};
