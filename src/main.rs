use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::Utc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use rmq_delivery::models::{OrderCreated, OrderLine};
use rmq_delivery::rabbitmq::{
    handler_fn, ConnectionManager, Consumer, DeliveryCoordinator, HandlerError, PublishOptions, Publisher,
};
use rmq_delivery::{env, Acknowledgement, Message, RabbitConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = env::load().context("loading RabbitMQ configuration")?;
    let mode = std::env::args().nth(1).unwrap_or_else(|| "billing".to_string());

    let connections = Arc::new(ConnectionManager::lapin(&config.connection));
    connections.on_disconnect(|reason| error!("RabbitMQ connection lost: {}", reason));

    match mode.as_str() {
        "billing" => run_billing(&config, connections).await,
        "orders" => run_orders(&config, connections).await,
        other => bail!("unknown mode '{}', expected 'billing' or 'orders'", other),
    }
}

async fn run_billing(config: &RabbitConfig, connections: Arc<ConnectionManager>) -> anyhow::Result<()> {
    let queue = config.queue("BILLING").context("looking up the billing queue")?;
    let coordinator = Arc::new(DeliveryCoordinator::new(&config.delivery));
    let janitor = coordinator.spawn_janitor(config.delivery.retention() / 4);
    let consumer = Consumer::new(connections.clone(), coordinator, &config.delivery);

    let handler = handler_fn(|message: Message| async move {
        let order: OrderCreated = message.json()?;
        info!(
            order_id = %order.order_id,
            customer_id = %order.customer_id,
            total_cents = order.total_cents(),
            attempt = message.attempt,
            "Billing order"
        );
        if order.items.is_empty() {
            return Err(HandlerError::permanent(format!("order {} has no items", order.order_id)));
        }
        Ok(Acknowledgement::Ack)
    });

    let subscription = consumer
        .subscribe(queue, config.delivery.prefetch_limit, handler)
        .await
        .with_context(|| format!("subscribing to '{}'", queue))?;
    info!("Billing worker consuming '{}', press Ctrl-C to stop", queue);

    let stopped = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for Ctrl-C")?;
            info!("Shutting down");
            None
        }
        result = subscription.finished() => Some(result),
    };

    consumer.close().await;
    janitor.abort();
    connections.close().await.context("closing RabbitMQ connection")?;

    if let Some(result) = stopped {
        result.with_context(|| format!("subscription to '{}' failed", queue))?;
        bail!("subscription to '{}' stopped unexpectedly", queue);
    }
    Ok(())
}

async fn run_orders(config: &RabbitConfig, connections: Arc<ConnectionManager>) -> anyhow::Result<()> {
    let queue = config.queue("BILLING").context("looking up the billing queue")?;
    let publisher = Publisher::new(connections.clone());

    let order = OrderCreated {
        order_id: Uuid::new_v4().to_string(),
        customer_id: "customer-1".to_string(),
        items: vec![OrderLine {
            sku: "coffee-beans".to_string(),
            quantity: 2,
            unit_price_cents: 1450,
        }],
        created_at: Utc::now(),
    };

    let options = PublishOptions::from_settings(&config.delivery).with_message_id(order.order_id.clone());
    let result = tokio::time::timeout(Duration::from_secs(30), publisher.publish_json(queue, &order, &options))
        .await
        .context("timed out publishing order")?
        .context("publishing order")?;
    info!(
        message_id = %result.message_id,
        confirmed = result.confirmed,
        "Published OrderCreated to '{}'",
        result.destination
    );

    connections.close().await.context("closing RabbitMQ connection")?;
    Ok(())
}
