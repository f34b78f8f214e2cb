use std::time::Duration;

use tokio::sync::watch;

use rmq_delivery::models::{OrderCreated, OrderLine};
use rmq_delivery::rabbitmq::{handler_fn, DeliveryState, HandlerError, PublishOptions};
use rmq_delivery::{Acknowledgement, Message};

use crate::common::{settings, wait_until, Calls, Harness, DEAD_LETTER_QUEUE, QUEUE};

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_until_success() {
    let harness = Harness::new(settings(3));
    let calls = Calls::default();
    let seen = calls.clone();
    harness
        .subscribe(
            5,
            handler_fn(move |msg: Message| {
                let seen = seen.clone();
                async move {
                    seen.record(msg.attempt);
                    if msg.attempt < 3 {
                        Err(HandlerError::transient("ledger unavailable"))
                    } else {
                        Ok(Acknowledgement::Ack)
                    }
                }
            }),
        )
        .await;

    harness.publish("order-1").await;
    wait_until("ack", || harness.coordinator.state_of(QUEUE, "order-1") == Some(DeliveryState::Acked)).await;
    wait_until("settle", || harness.broker.unacked(QUEUE) == 0).await;

    assert_eq!(calls.attempts(), vec![1, 2, 3]);
    assert_eq!(harness.broker.queue_depth(QUEUE), 0);
    assert_eq!(harness.broker.queue_depth(DEAD_LETTER_QUEUE), 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_message_is_dead_lettered() {
    let harness = Harness::new(settings(2));
    let calls = Calls::default();
    let seen = calls.clone();
    harness
        .subscribe(
            5,
            handler_fn(move |msg: Message| {
                let seen = seen.clone();
                async move {
                    seen.record(msg.attempt);
                    Err(HandlerError::transient("ledger unavailable"))
                }
            }),
        )
        .await;

    harness.publish("order-1").await;
    wait_until("dead letter", || harness.broker.queue_depth(DEAD_LETTER_QUEUE) == 1).await;

    assert_eq!(calls.attempts(), vec![1, 2]);
    assert_eq!(harness.broker.messages(DEAD_LETTER_QUEUE)[0].id, "order-1");
    assert_eq!(harness.broker.queue_depth(QUEUE), 0);
    assert_eq!(
        harness.coordinator.state_of(QUEUE, "order-1"),
        Some(DeliveryState::DeadLettered)
    );
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_skips_retries() {
    let harness = Harness::new(settings(5));
    let calls = Calls::default();
    let seen = calls.clone();
    harness
        .subscribe(
            5,
            handler_fn(move |msg: Message| {
                let seen = seen.clone();
                async move {
                    seen.record(msg.attempt);
                    let order: OrderCreated = msg.json()?;
                    Ok::<_, HandlerError>(if order.items.is_empty() {
                        Acknowledgement::NackDeadLetter
                    } else {
                        Acknowledgement::Ack
                    })
                }
            }),
        )
        .await;

    // "{}" is not an OrderCreated, so decoding fails permanently.
    harness.publish("order-1").await;
    wait_until("dead letter", || harness.broker.queue_depth(DEAD_LETTER_QUEUE) == 1).await;
    assert_eq!(calls.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn message_without_id_is_dead_lettered_unhandled() {
    let harness = Harness::new(settings(3));
    let calls = Calls::default();
    let seen = calls.clone();
    harness
        .subscribe(
            5,
            handler_fn(move |msg: Message| {
                let seen = seen.clone();
                async move {
                    seen.record(msg.attempt);
                    Ok(Acknowledgement::Ack)
                }
            }),
        )
        .await;

    harness.broker.push_raw(QUEUE, b"{}");
    wait_until("dead letter", || harness.broker.queue_depth(DEAD_LETTER_QUEUE) == 1).await;
    wait_until("settle", || harness.broker.unacked(QUEUE) == 0).await;
    assert_eq!(calls.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn duplicate_is_not_processed_concurrently() {
    let harness = Harness::new(settings(3));
    let (release_tx, release_rx) = watch::channel(false);
    let calls = Calls::default();
    let seen = calls.clone();
    harness
        .subscribe(
            4,
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
    harness.publish("order-1").await;
    wait_until("first handler", || calls.count() == 1).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(calls.count(), 1);

    release_tx.send_replace(true);
    wait_until("drain", || {
        harness.broker.queue_depth(QUEUE) == 0 && harness.broker.unacked(QUEUE) == 0
    })
    .await;
    assert_eq!(calls.count(), 1);
    assert_eq!(harness.coordinator.state_of(QUEUE, "order-1"), Some(DeliveryState::Acked));
}

#[tokio::test(start_paused = true)]
async fn close_waits_for_in_flight_handlers() {
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
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    Ok(Acknowledgement::Ack)
                }
            }),
        )
        .await;

    harness.publish("order-1").await;
    wait_until("handler start", || calls.count() == 1).await;

    harness.consumer.close().await;
    assert!(!handle.is_active());
    assert_eq!(harness.coordinator.state_of(QUEUE, "order-1"), Some(DeliveryState::Acked));
    assert_eq!(harness.broker.unacked(QUEUE), 0);

    // Nothing is consumed after close.
    harness.publish("order-2").await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(calls.count(), 1);
    assert_eq!(harness.broker.queue_depth(QUEUE), 1);
}

#[tokio::test(start_paused = true)]
async fn order_event_round_trip() {
    let harness = Harness::new(settings(3));
    let (orders_tx, mut orders_rx) = tokio::sync::mpsc::unbounded_channel();
    harness
        .subscribe(
            1,
            handler_fn(move |msg: Message| {
                let orders_tx = orders_tx.clone();
                async move {
                    let order: OrderCreated = msg.json()?;
                    let _ = orders_tx.send(order);
                    Ok(Acknowledgement::Ack)
                }
            }),
        )
        .await;

    let order = OrderCreated {
        order_id: "order-9".to_string(),
        customer_id: "customer-3".to_string(),
        items: vec![OrderLine {
            sku: "filter-papers".to_string(),
            quantity: 3,
            unit_price_cents: 299,
        }],
        created_at: chrono::Utc::now(),
    };
    let result = harness
        .publisher
        .publish_json(QUEUE, &order, &PublishOptions::default().with_message_id("order-9"))
        .await
        .unwrap();
    assert!(result.confirmed);

    let received = orders_rx.recv().await.unwrap();
    assert_eq!(received, order);

    // An acknowledged message is never delivered again.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(orders_rx.try_recv().is_err());
    assert_eq!(harness.broker.queue_depth(QUEUE), 0);
    assert_eq!(harness.broker.unacked(QUEUE), 0);
}
