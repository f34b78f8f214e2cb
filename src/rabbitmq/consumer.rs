use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use futures::StreamExt;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::amqp_client::{DeliveryStream, InboundDelivery, QueueSpec};
use super::connection::{Connection, ConnectionManager};
use super::coordinator::DeliveryCoordinator;
use super::errors::{ConfigError, ConnectionError, RabbitMQError};
use super::handler::MessageHandler;
use crate::config::DeliverySettings;

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Subscribes handlers to queues over the shared connection.
///
/// Each subscription owns a consumer on the shared channel and survives
/// reconnects: after a connection loss it declares the queue again and
/// resubscribes with the same prefetch limit.
pub struct Consumer {
    connections: Arc<ConnectionManager>,
    coordinator: Arc<DeliveryCoordinator>,
    settings: DeliverySettings,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
}

impl Consumer {
    pub fn new(
        connections: Arc<ConnectionManager>,
        coordinator: Arc<DeliveryCoordinator>,
        settings: &DeliverySettings,
    ) -> Self {
        Self {
            connections,
            coordinator,
            settings: settings.clone(),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Starts consuming `queue`, dispatching at most `prefetch_limit`
    /// deliveries to `handler` at a time.
    ///
    /// Returns once the broker has accepted the consumer.
    pub async fn subscribe(
        &self,
        queue: &str,
        prefetch_limit: u16,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle, RabbitMQError> {
        if prefetch_limit == 0 {
            return Err(ConfigError::invalid("prefetch_limit", "must be at least 1").into());
        }
        if queue.is_empty() {
            return Err(ConfigError::invalid("queue", "queue name is empty").into());
        }

        let subscription = Arc::new(Subscription {
            queue: queue.to_string(),
            prefetch: prefetch_limit,
            consumer_tag: format!("consumer-{}", Uuid::new_v4()),
            dead_letter_queue: self.settings.dead_letter_queue(queue),
            handler,
            connections: self.connections.clone(),
            coordinator: self.coordinator.clone(),
        });

        let (connection, stream) = subscription.attach().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(SubscriptionStatus::Active);
        let handle = SubscriptionHandle {
            inner: Arc::new(HandleInner {
                queue: subscription.queue.clone(),
                consumer_tag: subscription.consumer_tag.clone(),
                prefetch: prefetch_limit,
                shutdown: shutdown_tx,
                status: status_rx,
            }),
        };

        tokio::spawn(async move {
            let status = match subscription.run(connection, stream, shutdown_rx).await {
                Ok(()) => SubscriptionStatus::Cancelled,
                Err(err) => SubscriptionStatus::Failed(err),
            };
            status_tx.send_replace(status);
        });

        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
        subscriptions.retain(|h| h.is_active());
        subscriptions.push(handle.clone());
        Ok(handle)
    }

    /// Subscriptions still consuming.
    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|h| h.is_active())
            .count()
    }

    /// Cancels every subscription and waits for in-flight handlers.
    pub async fn close(&self) {
        let handles: Vec<SubscriptionHandle> = std::mem::take(
            &mut *self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner),
        );
        info!(subscriptions = handles.len(), "Closing consumer");
        join_all(handles.iter().map(|h| h.cancel())).await;
    }
}

#[derive(Debug, Clone)]
enum SubscriptionStatus {
    Active,
    Cancelled,
    Failed(ConnectionError),
}

#[derive(Clone)]
pub struct SubscriptionHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    queue: String,
    consumer_tag: String,
    prefetch: u16,
    shutdown: watch::Sender<bool>,
    status: watch::Receiver<SubscriptionStatus>,
}

impl SubscriptionHandle {
    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.inner.consumer_tag
    }

    pub fn prefetch_limit(&self) -> u16 {
        self.inner.prefetch
    }

    pub fn is_active(&self) -> bool {
        matches!(*self.inner.status.borrow(), SubscriptionStatus::Active)
    }

    /// Stops receiving new deliveries and waits for the ones being handled.
    pub async fn cancel(&self) {
        self.inner.shutdown.send_replace(true);
        if let Err(err) = self.finished().await {
            debug!(queue = %self.inner.queue, "Subscription had already failed: {}", err);
        }
    }

    /// Resolves when the subscription has stopped. A subscription that
    /// ended because reconnecting failed for good returns that error.
    pub async fn finished(&self) -> Result<(), ConnectionError> {
        let mut status = self.inner.status.clone();
        let stopped = match status.wait_for(|s| !matches!(s, SubscriptionStatus::Active)).await {
            Ok(stopped) => stopped.clone(),
            Err(_) => {
                return Err(ConnectionError::Channel(
                    "subscription task ended unexpectedly".to_string(),
                ))
            }
        };
        match stopped {
            SubscriptionStatus::Failed(err) => Err(err),
            _ => Ok(()),
        }
    }
}

struct Subscription {
    queue: String,
    prefetch: u16,
    consumer_tag: String,
    dead_letter_queue: Option<String>,
    handler: Arc<dyn MessageHandler>,
    connections: Arc<ConnectionManager>,
    coordinator: Arc<DeliveryCoordinator>,
}

enum StreamEnd {
    Shutdown,
    Lost,
}

impl Subscription {
    async fn attach(&self) -> Result<(Connection, DeliveryStream), ConnectionError> {
        let connection = self.connections.connect().await?;
        let channel = connection.channel();

        channel
            .declare_queue(&QueueSpec::durable(&self.queue).with_dead_letter(self.dead_letter_queue.clone()))
            .await?;
        let stream = channel.consume(&self.queue, self.prefetch, &self.consumer_tag).await?;

        info!(
            queue = %self.queue,
            prefetch = self.prefetch,
            generation = connection.generation(),
            consumer_tag = %self.consumer_tag,
            "Subscribed"
        );
        Ok((connection, stream))
    }

    async fn run(
        self: Arc<Self>,
        mut connection: Connection,
        mut stream: DeliveryStream,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ConnectionError> {
        let permits = Arc::new(Semaphore::new(usize::from(self.prefetch)));
        let mut in_flight = JoinSet::new();
        let mut outcome = Ok(());

        loop {
            match self
                .pump(&connection, &mut stream, &permits, &mut in_flight, &mut shutdown)
                .await
            {
                StreamEnd::Shutdown => {
                    if let Err(err) = connection.channel().cancel(&self.consumer_tag).await {
                        debug!(queue = %self.queue, "Cancel failed, channel already gone: {}", err);
                    }
                    break;
                }
                StreamEnd::Lost => {
                    warn!(queue = %self.queue, "Delivery stream ended, resubscribing");
                }
            }

            match self.reattach(&mut shutdown).await {
                Ok(Some((next_connection, next_stream))) => {
                    connection = next_connection;
                    stream = next_stream;
                }
                Ok(None) => break,
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }

        info!(queue = %self.queue, in_flight = in_flight.len(), "Draining in-flight handlers");
        while let Some(result) = in_flight.join_next().await {
            log_join(&self.queue, result);
        }
        info!(queue = %self.queue, "Subscription closed");
        outcome
    }

    /// Feeds deliveries from one stream to handlers until it ends or the
    /// subscription is cancelled.
    async fn pump(
        &self,
        connection: &Connection,
        stream: &mut DeliveryStream,
        permits: &Arc<Semaphore>,
        in_flight: &mut JoinSet<()>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> StreamEnd {
        loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => return StreamEnd::Shutdown,
                Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_join(&self.queue, result);
                    continue;
                }
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return StreamEnd::Shutdown,
                },
            };

            let next = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => return StreamEnd::Shutdown,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let coordinator = self.coordinator.clone();
                    let handler = self.handler.clone();
                    let channel = connection.channel().clone();
                    let queue = self.queue.clone();
                    in_flight.spawn(async move {
                        let _permit = permit;
                        let InboundDelivery { message, acker, .. } = delivery;
                        let outcome = match message {
                            Ok(message) => coordinator.process(message, handler).await,
                            Err(err) => coordinator.reject_undecodable(&queue, &err),
                        };
                        if let Err(err) = channel.settle(acker.as_ref(), outcome).await {
                            warn!(queue = %queue, ?outcome, "Settle failed, broker will redeliver: {}", err);
                        }
                    });
                }
                Some(Err(err)) => {
                    warn!(queue = %self.queue, "Delivery stream error: {}", err);
                    return StreamEnd::Lost;
                }
                None => return StreamEnd::Lost,
            }
        }
    }

    /// `Ok(None)` when cancelled, `Err` once reconnecting failed for good.
    async fn reattach(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<(Connection, DeliveryStream)>, ConnectionError> {
        loop {
            if *shutdown.borrow() {
                return Ok(None);
            }

            let attempt = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => return Ok(None),
                attempt = self.attach() => attempt,
            };

            match attempt {
                Ok(attached) => return Ok(Some(attached)),
                Err(ConnectionError::Shutdown) => {
                    info!(queue = %self.queue, "Connection manager closed, ending subscription");
                    return Ok(None);
                }
                Err(err) if err.is_fatal() => {
                    error!(queue = %self.queue, "Giving up on subscription: {}", err);
                    return Err(err);
                }
                Err(err) => {
                    warn!(queue = %self.queue, "Resubscribe failed: {}", err);
                    tokio::select! {
                        _ = shutdown.wait_for(|stop| *stop) => return Ok(None),
                        _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
                    }
                }
            }
        }
    }
}

fn log_join(queue: &str, result: Result<(), tokio::task::JoinError>) {
    if let Err(err) = result {
        error!(queue = %queue, "Delivery task failed: {}", err);
    }
}
