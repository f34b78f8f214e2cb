use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::errors::{HandlerError, SerializationError};
use super::handler::MessageHandler;
use crate::config::DeliverySettings;
use crate::message::{Acknowledgement, Message};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryState {
    Received,
    Processing,
    Acked,
    Requeued,
    DeadLettered,
}

impl DeliveryState {
    /// A handler is running (or about to run) for this message.
    pub fn is_active(&self) -> bool {
        matches!(self, DeliveryState::Received | DeliveryState::Processing)
    }
}

#[derive(Clone, Debug)]
pub struct DeliveryRecord {
    pub attempts: u32,
    pub state: DeliveryState,
    pub last_seen_at: Instant,
}

/// What came back from one handler invocation.
#[derive(Debug)]
pub enum HandlerOutcome {
    Returned(Result<Acknowledgement, HandlerError>),
    Panicked(String),
    TimedOut,
}

/// Maps a handler outcome to the acknowledgement sent to the broker.
///
/// Retryable failures requeue until `attempt` reaches `max_attempts`, then
/// dead-letter. Permanent failures dead-letter right away.
pub fn escalate(outcome: &HandlerOutcome, attempt: u32, max_attempts: u32) -> Acknowledgement {
    let retry = if attempt >= max_attempts {
        Acknowledgement::NackDeadLetter
    } else {
        Acknowledgement::NackRequeue
    };

    match outcome {
        HandlerOutcome::Returned(Ok(Acknowledgement::Ack)) => Acknowledgement::Ack,
        HandlerOutcome::Returned(Ok(Acknowledgement::NackDeadLetter)) => Acknowledgement::NackDeadLetter,
        HandlerOutcome::Returned(Ok(Acknowledgement::NackRequeue)) => retry,
        HandlerOutcome::Returned(Err(err)) if err.is_retryable() => retry,
        HandlerOutcome::Returned(Err(_)) => Acknowledgement::NackDeadLetter,
        HandlerOutcome::Panicked(_) | HandlerOutcome::TimedOut => retry,
    }
}

enum Admission {
    Run(Message),
    InProgress,
    AlreadyAcked,
    AlreadyDeadLettered,
}

type RecordKey = (String, String);

/// Tracks every message id seen per queue and turns handler results into
/// acknowledgements.
///
/// Guarantees at most one running handler per `(queue, message id)` in this
/// process and a bounded number of attempts before dead-lettering.
pub struct DeliveryCoordinator {
    max_attempts: u32,
    processing_timeout: Duration,
    requeue_delay: Duration,
    retention: Duration,
    records: Mutex<HashMap<RecordKey, DeliveryRecord>>,
}

impl DeliveryCoordinator {
    pub fn new(settings: &DeliverySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            processing_timeout: settings.processing_timeout(),
            requeue_delay: settings.requeue_delay(),
            retention: settings.retention(),
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn records(&self) -> MutexGuard<'_, HashMap<RecordKey, DeliveryRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `handler` for one delivery and returns how to settle it.
    pub async fn process(&self, message: Message, handler: Arc<dyn MessageHandler>) -> Acknowledgement {
        let key = (message.destination.clone(), message.id.clone());

        let message = match self.admit(&key, message) {
            Admission::Run(message) => message,
            Admission::InProgress => {
                debug!(queue = %key.0, message_id = %key.1, "Duplicate delivery while in progress, requeueing");
                tokio::time::sleep(self.requeue_delay).await;
                return Acknowledgement::NackRequeue;
            }
            Admission::AlreadyAcked => {
                info!(queue = %key.0, message_id = %key.1, "Redelivery of acknowledged message, acking");
                return Acknowledgement::Ack;
            }
            Admission::AlreadyDeadLettered => {
                info!(queue = %key.0, message_id = %key.1, "Redelivery of dead-lettered message");
                return Acknowledgement::NackDeadLetter;
            }
        };

        if message.attempt > self.max_attempts {
            warn!(
                queue = %key.0,
                message_id = %key.1,
                attempt = message.attempt,
                "Attempts exhausted before processing, dead-lettering"
            );
            self.finish(&key, Acknowledgement::NackDeadLetter);
            return Acknowledgement::NackDeadLetter;
        }

        self.mark(&key, DeliveryState::Processing);
        let outcome = self.run_handler(&message, handler).await;
        let ack = escalate(&outcome, message.attempt, self.max_attempts);
        log_outcome(&message, &outcome, ack, self.max_attempts);

        self.finish(&key, ack);
        if ack == Acknowledgement::NackRequeue && !self.requeue_delay.is_zero() {
            tokio::time::sleep(self.requeue_delay).await;
        }
        ack
    }

    /// Outcome for a delivery that could not be decoded into a `Message`.
    pub fn reject_undecodable(&self, queue: &str, err: &SerializationError) -> Acknowledgement {
        error!(queue = %queue, "Undecodable delivery, dead-lettering: {}", err);
        Acknowledgement::NackDeadLetter
    }

    fn admit(&self, key: &RecordKey, message: Message) -> Admission {
        let now = Instant::now();
        let mut records = self.records();

        match records.get_mut(key) {
            Some(record) if record.state.is_active() => {
                record.last_seen_at = now;
                Admission::InProgress
            }
            Some(record) if record.state == DeliveryState::Acked => {
                record.last_seen_at = now;
                Admission::AlreadyAcked
            }
            Some(record) if record.state == DeliveryState::DeadLettered => {
                record.last_seen_at = now;
                Admission::AlreadyDeadLettered
            }
            Some(record) => {
                // Requeues of in-progress duplicates also bump broker delivery
                // counts, so once a record exists the local count is authoritative.
                let attempt = record.attempts.saturating_add(1);
                record.attempts = attempt;
                record.state = DeliveryState::Received;
                record.last_seen_at = now;
                Admission::Run(message.with_attempt(attempt))
            }
            None => {
                records.insert(
                    key.clone(),
                    DeliveryRecord {
                        attempts: message.attempt,
                        state: DeliveryState::Received,
                        last_seen_at: now,
                    },
                );
                Admission::Run(message)
            }
        }
    }

    fn mark(&self, key: &RecordKey, state: DeliveryState) {
        if let Some(record) = self.records().get_mut(key) {
            record.state = state;
            record.last_seen_at = Instant::now();
        }
    }

    fn finish(&self, key: &RecordKey, ack: Acknowledgement) {
        let state = match ack {
            Acknowledgement::Ack => DeliveryState::Acked,
            Acknowledgement::NackRequeue => DeliveryState::Requeued,
            Acknowledgement::NackDeadLetter => DeliveryState::DeadLettered,
        };
        self.mark(key, state);
    }

    async fn run_handler(&self, message: &Message, handler: Arc<dyn MessageHandler>) -> HandlerOutcome {
        let task_message = message.clone();
        let mut task = tokio::spawn(async move { handler.handle(&task_message).await });

        match tokio::time::timeout(self.processing_timeout, &mut task).await {
            Ok(Ok(result)) => HandlerOutcome::Returned(result),
            Ok(Err(join_error)) => HandlerOutcome::Panicked(join_error.to_string()),
            Err(_) => {
                task.abort();
                HandlerOutcome::TimedOut
            }
        }
    }

    pub fn state_of(&self, queue: &str, message_id: &str) -> Option<DeliveryState> {
        self.record_of(queue, message_id).map(|r| r.state)
    }

    pub fn attempts_of(&self, queue: &str, message_id: &str) -> u32 {
        self.record_of(queue, message_id).map_or(0, |r| r.attempts)
    }

    pub fn record_of(&self, queue: &str, message_id: &str) -> Option<DeliveryRecord> {
        self.records()
            .get(&(queue.to_string(), message_id.to_string()))
            .cloned()
    }

    pub fn tracked(&self) -> usize {
        self.records().len()
    }

    /// Forgets settled records not seen for longer than the retention
    /// window. Records with a running handler are kept.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut records = self.records();
        let before = records.len();
        records.retain(|_, r| r.state.is_active() || now.duration_since(r.last_seen_at) < self.retention);
        let purged = before - records.len();
        if purged > 0 {
            debug!(purged, remaining = records.len(), "Purged expired delivery records");
        }
        purged
    }

    /// Purges expired records every `interval` until the coordinator is dropped.
    pub fn spawn_janitor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let coordinator: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match coordinator.upgrade() {
                    Some(coordinator) => {
                        coordinator.purge_expired();
                    }
                    None => break,
                }
            }
        })
    }
}

fn log_outcome(message: &Message, outcome: &HandlerOutcome, ack: Acknowledgement, max_attempts: u32) {
    let reason = match outcome {
        HandlerOutcome::Returned(Ok(_)) => None,
        HandlerOutcome::Returned(Err(err)) => Some(err.to_string()),
        HandlerOutcome::Panicked(panic) => Some(format!("handler panicked: {}", panic)),
        HandlerOutcome::TimedOut => Some("handler timed out".to_string()),
    };

    match (ack, reason) {
        (Acknowledgement::Ack, _) => {
            debug!(queue = %message.destination, message_id = %message.id, attempt = message.attempt, "Processed")
        }
        (Acknowledgement::NackRequeue, reason) => warn!(
            queue = %message.destination,
            message_id = %message.id,
            attempt = message.attempt,
            max_attempts,
            "Requeueing: {}",
            reason.unwrap_or_else(|| "handler asked for retry".to_string())
        ),
        (Acknowledgement::NackDeadLetter, reason) => error!(
            queue = %message.destination,
            message_id = %message.id,
            attempt = message.attempt,
            max_attempts,
            "Dead-lettering: {}",
            reason.unwrap_or_else(|| "handler rejected message".to_string())
        ),
    }
}
