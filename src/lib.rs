pub mod config;
pub mod env;
pub mod message;
pub mod models;
pub mod rabbitmq;

pub use config::{ConnectionSettings, DeliverySettings, RabbitConfig};
pub use message::{Acknowledgement, Message};
