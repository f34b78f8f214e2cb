use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rmq_delivery::config::load_config_file;
use rmq_delivery::rabbitmq::{
    handler_fn, ConnectionManager, Consumer, DeliveryCoordinator, HandlerError, PublishOptions, Publisher,
};
use rmq_delivery::{Acknowledgement, Message, RabbitConfig};
use uuid::Uuid;

fn load_test_config() -> RabbitConfig {
    let mut config = load_config_file(Path::new("tests/fixtures/rmq_delivery.json")).unwrap();
    if let Ok(uri) = std::env::var("RABBIT_MQ_URI") {
        config.connection.uri = uri;
    }
    config
}

#[test]
fn fixture_config_is_valid() {
    let config = load_test_config();
    assert_eq!(config.queue("billing").unwrap(), "rmq_delivery.it.billing");
    assert_eq!(config.delivery.max_attempts, 2);
    assert!(config.delivery.confirm_delivery);
    assert_eq!(
        config.delivery.dead_letter_queue("rmq_delivery.it.billing").as_deref(),
        Some("rmq_delivery.it.billing.dlq")
    );
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn retried_message_is_acked_on_real_broker() {
    let config = load_test_config();
    let queue = format!("{}.{}", config.queue("BILLING").unwrap(), Uuid::new_v4());

    let connections = Arc::new(ConnectionManager::lapin(&config.connection));
    let coordinator = Arc::new(DeliveryCoordinator::new(&config.delivery));
    let consumer = Consumer::new(connections.clone(), coordinator, &config.delivery);
    let publisher = Publisher::new(connections.clone());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    consumer
        .subscribe(
            &queue,
            config.delivery.prefetch_limit,
            handler_fn(move |msg: Message| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(msg.attempt);
                    if msg.attempt == 1 {
                        Err(HandlerError::transient("first attempt fails"))
                    } else {
                        Ok(Acknowledgement::Ack)
                    }
                }
            }),
        )
        .await
        .unwrap();

    let result = publisher
        .publish(&queue, b"{}", &PublishOptions::default())
        .await
        .unwrap();
    assert!(result.confirmed);

    let first = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await.unwrap();
    let second = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await.unwrap();
    assert_eq!((first, second), (Some(1), Some(2)));

    consumer.close().await;
    connections.close().await.unwrap();
}
