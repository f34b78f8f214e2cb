use std::time::Duration;

use tokio::sync::watch;

use rmq_delivery::rabbitmq::{handler_fn, ConnectionError, ConnectionState, DeliveryState, PublishError, PublishOptions};
use rmq_delivery::{Acknowledgement, ConnectionSettings, Message};

use crate::common::{settings, wait_until, Calls, Harness, QUEUE};

#[tokio::test(start_paused = true)]
async fn consumer_resubscribes_with_same_prefetch() {
    let harness = Harness::new(settings(3));
    let (release_tx, release_rx) = watch::channel(false);
    let calls = Calls::default();
    let seen = calls.clone();
    harness
        .subscribe(
            7,
            handler_fn(move |msg: Message| {
                let seen = seen.clone();
                let mut release = release_rx.clone();
                async move {
                    seen.record(msg.attempt);
                    let _ = release.wait_for(|go| *go).await;
                    Ok(Acknowledgement::Ack)
                }
            }),
        )
        .await;

    harness.publish("order-1").await;
    wait_until("handler start", || calls.count() == 1).await;

    harness.broker.drop_connections();
    wait_until("resubscribe", || harness.broker.consume_log().len() == 2).await;
    assert_eq!(
        harness.broker.consume_log(),
        vec![(QUEUE.to_string(), 7), (QUEUE.to_string(), 7)]
    );
    assert_eq!(harness.broker.consumer_prefetches(QUEUE), vec![7]);
    assert_eq!(harness.connections.state(), ConnectionState::Connected);

    // The unacked copy comes back on the new connection while the first
    // handler is still running; it must not start a second handler.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(calls.count(), 1);

    release_tx.send_replace(true);
    wait_until("redelivered copy settled", || {
        harness.broker.queue_depth(QUEUE) == 0 && harness.broker.unacked(QUEUE) == 0
    })
    .await;
    assert_eq!(calls.count(), 1);
    assert_eq!(harness.coordinator.state_of(QUEUE, "order-1"), Some(DeliveryState::Acked));
}

#[tokio::test(start_paused = true)]
async fn consumer_resubscribes_after_channel_close() {
    let harness = Harness::new(settings(3));
    let calls = Calls::default();
    let seen = calls.clone();
    let handle = harness
        .subscribe(
            2,
            handler_fn(move |msg: Message| {
                let seen = seen.clone();
                async move {
                    seen.record(msg.attempt);
                    Ok(Acknowledgement::Ack)
                }
            }),
        )
        .await;

    harness.broker.close_channels();
    wait_until("resubscribe", || harness.broker.consume_log().len() == 2).await;
    assert_eq!(harness.broker.connections_opened(), 1);
    assert_eq!(harness.broker.consumer_prefetches(QUEUE), vec![2]);

    harness.publish("order-1").await;
    wait_until("handled on reopened channel", || calls.count() == 1).await;
    wait_until("acked", || harness.broker.unacked(QUEUE) == 0).await;
    assert!(handle.is_active());
    assert_eq!(harness.connections.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn subscription_ends_when_reconnect_gives_up() {
    let connection = ConnectionSettings {
        give_up_after_secs: Some(20),
        ..ConnectionSettings::new("amqp://memory")
    };
    let harness = Harness::with_connection(settings(3), connection);
    let handle = harness
        .subscribe(1, handler_fn(|_msg: Message| async { Ok(Acknowledgement::Ack) }))
        .await;

    harness.broker.set_available(false);
    harness.broker.drop_connections();

    let result = tokio::time::timeout(Duration::from_secs(120), handle.finished())
        .await
        .unwrap();
    assert!(matches!(result, Err(ConnectionError::GaveUp(_))));
    assert!(!handle.is_active());
    assert_eq!(harness.connections.state(), ConnectionState::Disconnected);
    assert!(harness.broker.connect_attempts() > 2);
}

#[tokio::test(start_paused = true)]
async fn publish_after_reconnect_uses_new_connection() {
    let harness = Harness::new(settings(3));
    harness.publish("order-1").await;
    assert_eq!(harness.broker.connections_opened(), 1);

    harness.broker.drop_connections();
    harness.publish("order-2").await;

    assert_eq!(harness.broker.connections_opened(), 2);
    let ids: Vec<String> = harness.broker.messages(QUEUE).into_iter().map(|m| m.id).collect();
    assert_eq!(ids, vec!["order-1".to_string(), "order-2".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn publish_after_close_is_connection_lost() {
    let harness = Harness::new(settings(3));
    harness.connections.close().await.unwrap();

    let err = harness
        .publisher
        .publish(QUEUE, b"{}", &PublishOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PublishError::ConnectionLost));
}
