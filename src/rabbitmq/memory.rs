// src/rabbitmq/memory.rs
//
// In-process broker with the AMQP behaviours the delivery core relies on:
// manual acks, per-consumer prefetch, requeue, per-queue dead-lettering,
// publisher confirms, channel closes and connection loss. Queues are created on first use.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::channel::mpsc;
use futures::{FutureExt, StreamExt};
use tokio::sync::watch;
use tracing::debug;

use super::amqp_client::{
    AmqpChannel, AmqpConnector, AmqpSession, DeliveryAcker, DeliveryStream, DisconnectCallback,
    InboundDelivery, OutboundMessage, PendingConfirm, QueueSpec,
};
use super::errors::{ConnectionError, PublishError, SerializationError};
use crate::message::{decode_attempt, Message};

type Shared = Arc<Mutex<BrokerState>>;
type Listener = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Clone)]
pub struct MemoryBroker {
    state: Shared,
    confirm_gate: Arc<watch::Sender<bool>>,
}

#[derive(Default)]
struct BrokerState {
    refuse_connections: bool,
    reject_publishes: bool,
    connect_attempts: usize,
    next_session: u64,
    next_tag: u64,
    next_channel: u64,
    published: usize,
    dropped: usize,
    sessions: HashMap<u64, SessionEntry>,
    /// Open channel id to owning session.
    open_channels: HashMap<u64, u64>,
    queues: HashMap<String, QueueState>,
    consumers: Vec<ConsumerEntry>,
    consume_log: Vec<(String, u16)>,
}

#[derive(Default)]
struct SessionEntry {
    connected: bool,
    listeners: Vec<Listener>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: BTreeMap<u64, Unacked>,
    dead_letter: Option<String>,
    round_robin: usize,
}

#[derive(Clone)]
struct StoredMessage {
    id: Option<String>,
    payload: Vec<u8>,
    attempt: u32,
    enqueued_at: DateTime<Utc>,
    redelivered: bool,
}

struct Unacked {
    message: StoredMessage,
    session: u64,
    channel: u64,
    consumer_tag: String,
}

struct ConsumerEntry {
    session: u64,
    channel: u64,
    queue: String,
    tag: String,
    prefetch: u16,
    in_flight: usize,
    tx: mpsc::UnboundedSender<Result<InboundDelivery, ConnectionError>>,
}

impl StoredMessage {
    fn to_message(&self, queue: &str) -> Result<Message, SerializationError> {
        let id = self.id.clone().ok_or(SerializationError::MissingMessageId)?;
        Ok(Message {
            id,
            payload: self.payload.clone(),
            destination: queue.to_string(),
            attempt: decode_attempt(Some(self.attempt), None, self.redelivered),
            enqueued_at: self.enqueued_at,
        })
    }
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BrokerState {
    fn is_connected(&self, session: u64) -> bool {
        self.sessions.get(&session).is_some_and(|s| s.connected)
    }

    fn is_channel_open(&self, channel: u64) -> bool {
        self.open_channels
            .get(&channel)
            .is_some_and(|session| self.is_connected(*session))
    }

    fn enqueue(&mut self, queue: &str, message: StoredMessage, handle: &Weak<Mutex<BrokerState>>) {
        self.queues.entry(queue.to_string()).or_default().ready.push_back(message);
        self.dispatch(queue, handle);
    }

    /// Pushes ready messages to consumers with spare prefetch capacity.
    fn dispatch(&mut self, queue: &str, handle: &Weak<Mutex<BrokerState>>) {
        loop {
            let eligible: Vec<usize> = self
                .consumers
                .iter()
                .enumerate()
                .filter(|(_, c)| c.queue == queue && c.in_flight < usize::from(c.prefetch))
                .map(|(i, _)| i)
                .collect();
            if eligible.is_empty() {
                return;
            }

            let Some(state) = self.queues.get_mut(queue) else {
                return;
            };
            let Some(message) = state.ready.pop_front() else {
                return;
            };
            let index = eligible[state.round_robin % eligible.len()];
            state.round_robin = state.round_robin.wrapping_add(1);

            self.next_tag += 1;
            let tag = self.next_tag;
            let consumer = &mut self.consumers[index];
            let delivery = InboundDelivery {
                message: message.to_message(queue),
                redelivered: message.redelivered,
                acker: Box::new(MemoryAcker {
                    state: handle.clone(),
                    channel: consumer.channel,
                    queue: queue.to_string(),
                    tag,
                }),
            };

            if consumer.tx.unbounded_send(Ok(delivery)).is_err() {
                debug!(consumer_tag = %consumer.tag, "Dropping consumer with closed stream");
                self.consumers.remove(index);
                if let Some(state) = self.queues.get_mut(queue) {
                    state.ready.push_front(message);
                }
                continue;
            }

            consumer.in_flight += 1;
            let unacked = Unacked {
                message,
                session: consumer.session,
                channel: consumer.channel,
                consumer_tag: consumer.tag.clone(),
            };
            if let Some(state) = self.queues.get_mut(queue) {
                state.unacked.insert(tag, unacked);
            }
        }
    }

    /// Returns matching unacked messages to the head of their queues.
    fn requeue_unacked(&mut self, owned: impl Fn(&Unacked) -> bool) {
        for state in self.queues.values_mut() {
            let tags: Vec<u64> = state
                .unacked
                .iter()
                .filter(|(_, u)| owned(u))
                .map(|(tag, _)| *tag)
                .collect();
            for tag in tags.into_iter().rev() {
                if let Some(unacked) = state.unacked.remove(&tag) {
                    let mut message = unacked.message;
                    message.redelivered = true;
                    state.ready.push_front(message);
                }
            }
        }
    }

    fn disconnect(&mut self, session: u64, handle: &Weak<Mutex<BrokerState>>) -> Vec<Listener> {
        let listeners = match self.sessions.get_mut(&session) {
            Some(entry) if entry.connected => {
                entry.connected = false;
                std::mem::take(&mut entry.listeners)
            }
            _ => return Vec::new(),
        };

        self.open_channels.retain(|_, owner| *owner != session);
        self.consumers.retain(|c| c.session != session);
        self.requeue_unacked(|u| u.session == session);
        self.dispatch_all(handle);
        listeners
    }

    /// Closes one channel; its consumers end and its unacked messages return.
    fn close_channel(&mut self, channel: u64, handle: &Weak<Mutex<BrokerState>>) {
        if self.open_channels.remove(&channel).is_none() {
            return;
        }
        self.consumers.retain(|c| c.channel != channel);
        self.requeue_unacked(|u| u.channel == channel);
        self.dispatch_all(handle);
    }

    fn dispatch_all(&mut self, handle: &Weak<Mutex<BrokerState>>) {
        let queues: Vec<String> = self.queues.keys().cloned().collect();
        for queue in queues {
            self.dispatch(&queue, handle);
        }
    }

    fn settle(
        &mut self,
        channel: u64,
        queue: &str,
        tag: u64,
        requeue: Option<bool>,
        handle: &Weak<Mutex<BrokerState>>,
    ) -> Result<(), ConnectionError> {
        if !self.is_channel_open(channel) {
            return Err(ConnectionError::Channel("channel closed".to_string()));
        }
        let state = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| ConnectionError::Channel(format!("no queue '{}'", queue)))?;
        let unacked = state
            .unacked
            .remove(&tag)
            .ok_or_else(|| ConnectionError::Channel(format!("unknown delivery tag {}", tag)))?;

        if let Some(consumer) = self
            .consumers
            .iter_mut()
            .find(|c| c.channel == unacked.channel && c.tag == unacked.consumer_tag)
        {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }

        match requeue {
            None => {}
            Some(true) => {
                let mut message = unacked.message;
                message.redelivered = true;
                state.ready.push_front(message);
            }
            Some(false) => match state.dead_letter.clone() {
                Some(dlq) => {
                    let mut message = unacked.message;
                    message.redelivered = false;
                    self.enqueue(&dlq, message, handle);
                }
                None => self.dropped += 1,
            },
        }

        self.dispatch(queue, handle);
        Ok(())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (confirm_gate, _) = watch::channel(true);
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            confirm_gate: Arc::new(confirm_gate),
        }
    }

    fn handle(&self) -> Weak<Mutex<BrokerState>> {
        Arc::downgrade(&self.state)
    }

    /// Refuse (or accept again) new connections.
    pub fn set_available(&self, available: bool) {
        lock(&self.state).refuse_connections = !available;
    }

    /// Nack every publish instead of enqueueing it.
    pub fn reject_publishes(&self, reject: bool) {
        lock(&self.state).reject_publishes = reject;
    }

    /// Publisher confirms wait until `release_confirms`.
    pub fn hold_confirms(&self) {
        self.confirm_gate.send_replace(false);
    }

    pub fn release_confirms(&self) {
        self.confirm_gate.send_replace(true);
    }

    /// Drops every open connection as a network failure would.
    pub fn drop_connections(&self) {
        let handle = self.handle();
        let listeners = {
            let mut state = lock(&self.state);
            let sessions: Vec<u64> = state.sessions.keys().copied().collect();
            let mut listeners = Vec::new();
            for session in sessions {
                listeners.extend(state.disconnect(session, &handle));
            }
            listeners
        };

        for listener in listeners {
            listener("connection reset by broker".to_string());
        }
    }

    /// Closes every open channel as a broker channel exception would,
    /// leaving the connections up.
    pub fn close_channels(&self) {
        let handle = self.handle();
        let mut state = lock(&self.state);
        let channels: Vec<u64> = state.open_channels.keys().copied().collect();
        for channel in channels {
            state.close_channel(channel, &handle);
        }
    }

    /// Enqueues a message without a message id.
    pub fn push_raw(&self, queue: &str, payload: &[u8]) {
        let message = StoredMessage {
            id: None,
            payload: payload.to_vec(),
            attempt: 1,
            enqueued_at: Utc::now(),
            redelivered: false,
        };
        let handle = self.handle();
        lock(&self.state).enqueue(queue, message, &handle);
    }

    /// Messages waiting in `queue`, oldest first.
    pub fn messages(&self, queue: &str) -> Vec<Message> {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.ready.iter().filter_map(|m| m.to_message(queue).ok()).collect())
            .unwrap_or_default()
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        lock(&self.state).queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn unacked(&self, queue: &str) -> usize {
        lock(&self.state).queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    pub fn dead_letter_of(&self, queue: &str) -> Option<String> {
        lock(&self.state).queues.get(queue).and_then(|q| q.dead_letter.clone())
    }

    /// Prefetch limits of the live consumers on `queue`.
    pub fn consumer_prefetches(&self, queue: &str) -> Vec<u16> {
        lock(&self.state)
            .consumers
            .iter()
            .filter(|c| c.queue == queue)
            .map(|c| c.prefetch)
            .collect()
    }

    /// Every `basic.consume` seen so far as `(queue, prefetch)`.
    pub fn consume_log(&self) -> Vec<(String, u16)> {
        lock(&self.state).consume_log.clone()
    }

    pub fn connect_attempts(&self) -> usize {
        lock(&self.state).connect_attempts
    }

    pub fn connections_opened(&self) -> usize {
        lock(&self.state).sessions.len()
    }

    pub fn published(&self) -> usize {
        lock(&self.state).published
    }

    /// Dead-lettered messages discarded for lack of a dead-letter queue.
    pub fn dropped(&self) -> usize {
        lock(&self.state).dropped
    }
}

#[async_trait]
impl AmqpConnector for MemoryBroker {
    async fn connect(&self, _uri: &str) -> Result<Arc<dyn AmqpSession>, ConnectionError> {
        let mut state = lock(&self.state);
        state.connect_attempts += 1;
        if state.refuse_connections {
            return Err(ConnectionError::Connect("connection refused".to_string()));
        }

        state.next_session += 1;
        let id = state.next_session;
        state.sessions.insert(
            id,
            SessionEntry {
                connected: true,
                listeners: Vec::new(),
            },
        );

        Ok(Arc::new(MemorySession {
            broker: self.clone(),
            id,
        }))
    }
}

struct MemorySession {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl AmqpSession for MemorySession {
    fn is_connected(&self) -> bool {
        lock(&self.broker.state).is_connected(self.id)
    }

    fn on_disconnect(&self, callback: DisconnectCallback) {
        if let Some(entry) = lock(&self.broker.state).sessions.get_mut(&self.id) {
            entry.listeners.push(Arc::from(callback));
        }
    }

    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, ConnectionError> {
        let mut state = lock(&self.broker.state);
        if !state.is_connected(self.id) {
            return Err(ConnectionError::NotConnected);
        }
        state.next_channel += 1;
        let id = state.next_channel;
        state.open_channels.insert(id, self.id);

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            session: self.id,
            id,
        }))
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        let handle = self.broker.handle();
        // Graceful close does not notify listeners.
        let _ = lock(&self.broker.state).disconnect(self.id, &handle);
        Ok(())
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    session: u64,
    id: u64,
}

impl MemoryChannel {
    fn ensure_open(&self, state: &BrokerState) -> Result<(), ConnectionError> {
        if state.is_channel_open(self.id) {
            Ok(())
        } else {
            Err(ConnectionError::Channel("channel closed".to_string()))
        }
    }
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        lock(&self.broker.state).is_channel_open(self.id)
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), ConnectionError> {
        let mut state = lock(&self.broker.state);
        self.ensure_open(&state)?;
        if let Some(dlq) = &spec.dead_letter_queue {
            state.queues.entry(dlq.clone()).or_default();
        }
        state.queues.entry(spec.name.clone()).or_default().dead_letter = spec.dead_letter_queue.clone();
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, ConnectionError> {
        let handle = self.broker.handle();
        let mut state = lock(&self.broker.state);
        self.ensure_open(&state)?;

        let (tx, rx) = mpsc::unbounded();
        state.queues.entry(queue.to_string()).or_default();
        state.consume_log.push((queue.to_string(), prefetch));
        state.consumers.push(ConsumerEntry {
            session: self.session,
            channel: self.id,
            queue: queue.to_string(),
            tag: consumer_tag.to_string(),
            prefetch,
            in_flight: 0,
            tx,
        });
        state.dispatch(queue, &handle);

        Ok(rx.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), ConnectionError> {
        let mut state = lock(&self.broker.state);
        self.ensure_open(&state)?;
        state
            .consumers
            .retain(|c| !(c.channel == self.id && c.tag == consumer_tag));
        Ok(())
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<PendingConfirm, PublishError> {
        let handle = self.broker.handle();
        let rejected = {
            let mut state = lock(&self.broker.state);
            if !state.is_connected(self.session) {
                return Err(PublishError::ConnectionLost);
            }
            if !state.is_channel_open(self.id) {
                return Err(PublishError::Channel("channel closed".to_string()));
            }
            if !state.reject_publishes {
                state.published += 1;
                let stored = StoredMessage {
                    id: Some(message.id.clone()),
                    payload: message.payload.clone(),
                    attempt: message.attempt,
                    enqueued_at: message.enqueued_at,
                    redelivered: false,
                };
                state.enqueue(&message.destination, stored, &handle);
            }
            state.reject_publishes
        };

        let broker = self.broker.clone();
        let session = self.session;
        let mut gate = self.broker.confirm_gate.subscribe();
        let destination = message.destination.clone();
        let message_id = message.id.clone();
        Ok(async move {
            gate.wait_for(|open| *open)
                .await
                .map_err(|_| PublishError::ConnectionLost)?;
            if !lock(&broker.state).is_connected(session) {
                return Err(PublishError::ConnectionLost);
            }
            if rejected {
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

struct MemoryAcker {
    state: Weak<Mutex<BrokerState>>,
    channel: u64,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> Result<(), ConnectionError> {
        let shared = self
            .state
            .upgrade()
            .ok_or_else(|| ConnectionError::Channel("broker is gone".to_string()))?;
        let mut state = lock(&shared);
        state.settle(self.channel, &self.queue, self.tag, requeue, &self.state)
    }
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> Result<(), ConnectionError> {
        self.settle(None)
    }

    async fn nack(&self, requeue: bool) -> Result<(), ConnectionError> {
        self.settle(Some(requeue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound(id: &str, queue: &str) -> OutboundMessage {
        OutboundMessage {
            id: id.to_string(),
            destination: queue.to_string(),
            payload: id.as_bytes().to_vec(),
            persistent: true,
            attempt: 1,
            enqueued_at: Utc::now(),
        }
    }

    async fn channel(broker: &MemoryBroker) -> Arc<dyn AmqpChannel> {
        let session = broker.connect("amqp://memory").await.unwrap();
        session.open_channel().await.unwrap()
    }

    #[tokio::test]
    async fn prefetch_bounds_unacked_deliveries() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        for i in 0..5 {
            channel.publish(&outbound(&format!("m{}", i), "jobs")).await.unwrap().await.unwrap();
        }

        let mut stream = channel.consume("jobs", 2, "c1").await.unwrap();
        assert_eq!(broker.unacked("jobs"), 2);
        assert_eq!(broker.queue_depth("jobs"), 3);

        let first = stream.next().await.unwrap().unwrap();
        first.acker.ack().await.unwrap();
        assert_eq!(broker.unacked("jobs"), 2);
        assert_eq!(broker.queue_depth("jobs"), 2);
    }

    #[tokio::test]
    async fn requeue_marks_redelivered_and_dead_letter_routes() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        channel
            .declare_queue(&QueueSpec::durable("jobs").with_dead_letter(Some("jobs.dlq".into())))
            .await
            .unwrap();
        channel.publish(&outbound("m1", "jobs")).await.unwrap().await.unwrap();

        let mut stream = channel.consume("jobs", 1, "c1").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        first.acker.nack(true).await.unwrap();

        let second = stream.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        assert_eq!(second.message.as_ref().unwrap().attempt, 2);
        second.acker.nack(false).await.unwrap();

        assert_eq!(broker.queue_depth("jobs"), 0);
        let dead = broker.messages("jobs.dlq");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, "m1");
    }

    #[tokio::test]
    async fn dropped_connection_requeues_unacked() {
        let broker = MemoryBroker::new();
        let session = broker.connect("amqp://memory").await.unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        session.on_disconnect(Box::new(move |reason| {
            let _ = tx.send(reason);
        }));
        let channel = session.open_channel().await.unwrap();
        channel.publish(&outbound("m1", "jobs")).await.unwrap().await.unwrap();

        let mut stream = channel.consume("jobs", 1, "c1").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();

        broker.drop_connections();
        assert!(!session.is_connected());
        assert!(rx.try_recv().is_ok());
        assert!(stream.next().await.is_none());
        assert!(delivery.acker.ack().await.is_err());
        assert_eq!(broker.queue_depth("jobs"), 1);
    }

    #[tokio::test]
    async fn closed_channel_requeues_and_ends_consumers() {
        let broker = MemoryBroker::new();
        let session = broker.connect("amqp://memory").await.unwrap();
        let channel = session.open_channel().await.unwrap();
        channel.publish(&outbound("m1", "jobs")).await.unwrap().await.unwrap();

        let mut stream = channel.consume("jobs", 1, "c1").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();

        broker.close_channels();
        assert!(session.is_connected());
        assert!(!channel.is_open());
        assert!(stream.next().await.is_none());
        assert!(delivery.acker.ack().await.is_err());
        assert_eq!(broker.queue_depth("jobs"), 1);
        assert!(matches!(
            channel.publish(&outbound("m2", "jobs")).await,
            Err(PublishError::Channel(_))
        ));

        let reopened = session.open_channel().await.unwrap();
        assert!(reopened.is_open());
    }

    #[tokio::test]
    async fn rejected_publish_is_nacked() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        broker.reject_publishes(true);

        let confirm = channel.publish(&outbound("m1", "jobs")).await.unwrap();
        assert!(matches!(confirm.await, Err(PublishError::Nacked { .. })));
        assert_eq!(broker.queue_depth("jobs"), 0);
    }
}
