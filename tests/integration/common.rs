use std::sync::{Arc, Mutex};
use std::time::Duration;

use rmq_delivery::rabbitmq::{
    ConnectionManager, Consumer, DeliveryCoordinator, MemoryBroker, MessageHandler, PublishOptions, Publisher,
    SubscriptionHandle,
};
use rmq_delivery::{ConnectionSettings, DeliverySettings};

pub const QUEUE: &str = "billing";
pub const DEAD_LETTER_QUEUE: &str = "billing.dlq";

pub struct Harness {
    pub broker: MemoryBroker,
    pub connections: Arc<ConnectionManager>,
    pub coordinator: Arc<DeliveryCoordinator>,
    pub consumer: Consumer,
    pub publisher: Publisher,
}

pub fn settings(max_attempts: u32) -> DeliverySettings {
    DeliverySettings {
        max_attempts,
        processing_timeout_ms: 5_000,
        requeue_delay_ms: 100,
        ..DeliverySettings::default()
    }
}

impl Harness {
    pub fn new(delivery: DeliverySettings) -> Self {
        Self::with_connection(delivery, ConnectionSettings::new("amqp://memory"))
    }

    pub fn with_connection(delivery: DeliverySettings, connection: ConnectionSettings) -> Self {
        let broker = MemoryBroker::new();
        let connections = Arc::new(ConnectionManager::new(&connection, Arc::new(broker.clone())));
        let coordinator = Arc::new(DeliveryCoordinator::new(&delivery));
        let consumer = Consumer::new(connections.clone(), coordinator.clone(), &delivery);
        let publisher = Publisher::new(connections.clone());
        Self {
            broker,
            connections,
            coordinator,
            consumer,
            publisher,
        }
    }

    pub async fn subscribe(&self, prefetch: u16, handler: Arc<dyn MessageHandler>) -> SubscriptionHandle {
        self.consumer.subscribe(QUEUE, prefetch, handler).await.unwrap()
    }

    pub async fn publish(&self, message_id: &str) {
        let options = PublishOptions::default().with_message_id(message_id);
        let result = self.publisher.publish(QUEUE, b"{}", &options).await.unwrap();
        assert!(result.confirmed);
    }
}

/// Polls `condition` on the (usually paused) tokio clock.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(120);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Clone, Default)]
pub struct Calls {
    attempts: Arc<Mutex<Vec<u32>>>,
}

impl Calls {
    pub fn record(&self, attempt: u32) {
        self.attempts.lock().unwrap().push(attempt);
    }

    pub fn attempts(&self) -> Vec<u32> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }
}
