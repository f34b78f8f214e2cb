use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use super::amqp_client::{AmqpConnector, AmqpSession};
use super::channel_manager::ChannelManager;
use super::errors::ConnectionError;
use super::lapin_client::LapinConnector;
use crate::config::ConnectionSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Exponential backoff with full jitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_cap_ms")]
    pub cap_ms: u64,
}

fn default_base_ms() -> u64 { 500 }
fn default_cap_ms() -> u64 { 30_000 }

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            cap_ms: default_cap_ms(),
        }
    }
}

impl BackoffPolicy {
    /// Upper bound of the delay after `retry` failed attempts (0-based).
    pub fn ceiling(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_ms.saturating_mul(factor).min(self.cap_ms))
    }

    /// Uniformly random delay in `0..=ceiling(retry)`.
    pub fn delay(&self, retry: u32) -> Duration {
        let ceiling = self.ceiling(retry).as_millis() as u64;
        Duration::from_millis(rand::random_range(0..=ceiling))
    }
}

/// An established connection and its shared channel.
#[derive(Clone)]
pub struct Connection {
    session: Arc<dyn AmqpSession>,
    channel: Arc<ChannelManager>,
    generation: u64,
}

impl Connection {
    pub fn channel(&self) -> &Arc<ChannelManager> {
        &self.channel
    }

    /// Increases by one for every connection the manager establishes.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Both the session and its shared channel are usable.
    pub fn is_connected(&self) -> bool {
        self.session.is_connected() && self.channel.is_open()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("generation", &self.generation)
            .field("connected", &self.is_connected())
            .finish()
    }
}

type DisconnectListener = Arc<dyn Fn(&str) + Send + Sync>;

struct Shared {
    state: watch::Sender<ConnectionState>,
    generation: AtomicU64,
    listeners: Mutex<Vec<DisconnectListener>>,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = ?previous, to = ?next, "Connection state changed");
        }
    }

    fn handle_disconnect(&self, generation: u64, reason: &str) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }

        let dropped = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
        if !dropped {
            return;
        }

        warn!(generation, reason, "RabbitMQ connection lost");
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener(reason);
        }
    }
}

/// Owns the single broker connection of the process.
///
/// `connect` is idempotent: callers arriving while a connect loop runs wait
/// on the same lock and receive the connection it produced.
pub struct ConnectionManager {
    uri: String,
    connector: Arc<dyn AmqpConnector>,
    policy: BackoffPolicy,
    give_up_after: Option<Duration>,
    current: AsyncMutex<Option<Connection>>,
    shutdown: watch::Sender<bool>,
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(settings: &ConnectionSettings, connector: Arc<dyn AmqpConnector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);

        Self {
            uri: settings.uri.clone(),
            connector,
            policy: settings.reconnect.clone(),
            give_up_after: settings.give_up_after(),
            current: AsyncMutex::new(None),
            shutdown,
            shared: Arc::new(Shared {
                state,
                generation: AtomicU64::new(0),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Manager backed by lapin.
    pub fn lapin(settings: &ConnectionSettings) -> Self {
        Self::new(settings, Arc::new(LapinConnector))
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Registers a callback run with the reason whenever an established
    /// connection drops unexpectedly.
    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Returns the live connection, establishing one if needed.
    pub async fn connect(&self) -> Result<Connection, ConnectionError> {
        let mut current = self.current.lock().await;
        if self.is_shut_down() {
            return Err(ConnectionError::Shutdown);
        }

        if let Some(connection) = current.take() {
            if connection.is_connected() {
                *current = Some(connection.clone());
                return Ok(connection);
            }
            if let Some(reopened) = self.reopen_channel(&connection).await {
                *current = Some(reopened.clone());
                return Ok(reopened);
            }
        }

        let connection = self.establish().await?;
        *current = Some(connection.clone());
        Ok(connection)
    }

    /// Replaces a channel the broker closed while the session stayed up.
    /// Falls back to a full reconnect when that fails.
    async fn reopen_channel(&self, connection: &Connection) -> Option<Connection> {
        let generation = connection.generation;
        if connection.session.is_connected() {
            warn!(generation, "Shared channel closed by broker, reopening");
            match connection.session.open_channel().await {
                Ok(channel) => {
                    return Some(Connection {
                        session: Arc::clone(&connection.session),
                        channel: Arc::new(ChannelManager::new(channel, generation)),
                        generation,
                    });
                }
                Err(err) => warn!(generation, "Failed to reopen channel: {}", err),
            }
        }

        debug!(generation, "Discarding stale connection");
        // Not an unexpected drop, keep listeners quiet while the session closes.
        self.shared.set_state(ConnectionState::Connecting);
        if let Err(err) = connection.session.close().await {
            debug!(generation, "Closing stale session failed: {}", err);
        }
        None
    }

    async fn establish(&self) -> Result<Connection, ConnectionError> {
        let started = Instant::now();
        let mut shutdown = self.shutdown.subscribe();
        let mut retry: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return Err(ConnectionError::Shutdown);
            }

            self.shared.set_state(ConnectionState::Connecting);
            info!(attempt = retry + 1, "Attempting to connect to RabbitMQ");

            let opened = tokio::select! {
                opened = self.open() => opened,
                _ = shutdown.wait_for(|closed| *closed) => {
                    return Err(ConnectionError::Shutdown);
                }
            };

            let err = match opened {
                Ok(connection) => {
                    self.shared.set_state(ConnectionState::Connected);
                    info!(generation = connection.generation, "Connected to RabbitMQ");
                    return Ok(connection);
                }
                Err(err) => err,
            };

            if let Some(limit) = self.give_up_after {
                if started.elapsed() >= limit {
                    self.shared.set_state(ConnectionState::Disconnected);
                    error!(attempts = retry + 1, "Failed to connect to RabbitMQ within {:?}: {}", limit, err);
                    return Err(ConnectionError::GaveUp(limit));
                }
            }

            let delay = self.policy.delay(retry);
            retry = retry.saturating_add(1);
            warn!(
                attempt = retry,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Failed to connect to RabbitMQ, retrying"
            );

            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.wait_for(|closed| *closed) => {
                    return Err(ConnectionError::Shutdown);
                }
            }
        }
    }

    async fn open(&self) -> Result<Connection, ConnectionError> {
        let session = self.connector.connect(&self.uri).await?;
        let channel = session.open_channel().await?;
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let shared = Arc::clone(&self.shared);
        session.on_disconnect(Box::new(move |reason| {
            shared.handle_disconnect(generation, &reason);
        }));

        Ok(Connection {
            session,
            channel: Arc::new(ChannelManager::new(channel, generation)),
            generation,
        })
    }

    /// Stops reconnecting and closes the connection. Later `connect` calls
    /// fail with `ConnectionError::Shutdown`.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        self.shutdown.send_replace(true);
        self.shared.set_state(ConnectionState::Closing);

        let connection = self.current.lock().await.take();
        let result = match connection {
            Some(connection) => {
                info!(generation = connection.generation, "Closing RabbitMQ connection gracefully");
                connection.session.close().await
            }
            None => Ok(()),
        };

        self.shared.set_state(ConnectionState::Disconnected);
        result
    }
}
