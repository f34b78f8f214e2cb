// src/config.rs
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::rabbitmq::connection::BackoffPolicy;
use crate::rabbitmq::errors::ConfigError;

// Configuration structures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RabbitConfig {
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub delivery: DeliverySettings,
    /// Logical channel name (upper case, e.g. `BILLING`) to queue name.
    #[serde(default)]
    pub queues: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    pub uri: String,
    #[serde(default)]
    pub reconnect: BackoffPolicy,
    /// Wall-clock ceiling for (re)connecting. `null` retries forever.
    #[serde(default = "default_give_up_secs")]
    pub give_up_after_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliverySettings {
    #[serde(default = "default_prefetch_limit")]
    pub prefetch_limit: u16,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_processing_timeout_ms")]
    pub processing_timeout_ms: u64,
    #[serde(default = "default_requeue_delay_ms")]
    pub requeue_delay_ms: u64,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_confirm_delivery")]
    pub confirm_delivery: bool,
    /// Dead-letter queue is `<queue><suffix>`. `null` drops dead letters.
    #[serde(default = "default_dead_letter_suffix")]
    pub dead_letter_suffix: Option<String>,
}

// Default values
fn default_give_up_secs() -> Option<u64> { Some(300) }
fn default_prefetch_limit() -> u16 { 10 }
fn default_max_attempts() -> u32 { 3 }
fn default_processing_timeout_ms() -> u64 { 30_000 }
fn default_requeue_delay_ms() -> u64 { 1_000 }
fn default_retention_secs() -> u64 { 900 }
fn default_confirm_delivery() -> bool { true }
fn default_dead_letter_suffix() -> Option<String> { Some(".dlq".to_string()) }

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            prefetch_limit: default_prefetch_limit(),
            max_attempts: default_max_attempts(),
            processing_timeout_ms: default_processing_timeout_ms(),
            requeue_delay_ms: default_requeue_delay_ms(),
            retention_secs: default_retention_secs(),
            confirm_delivery: default_confirm_delivery(),
            dead_letter_suffix: default_dead_letter_suffix(),
        }
    }
}

impl ConnectionSettings {
    pub fn new(uri: &str) -> Self {
        Self {
            uri: uri.to_string(),
            reconnect: BackoffPolicy::default(),
            give_up_after_secs: default_give_up_secs(),
        }
    }

    pub fn give_up_after(&self) -> Option<Duration> {
        self.give_up_after_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.uri.is_empty() {
            return Err(ConfigError::Missing("connection.uri".to_string()));
        }
        if !(self.uri.starts_with("amqp://") || self.uri.starts_with("amqps://")) {
            return Err(ConfigError::invalid(
                "connection.uri",
                "expected an amqp:// or amqps:// URI",
            ));
        }
        if self.reconnect.base_ms == 0 || self.reconnect.cap_ms < self.reconnect.base_ms {
            return Err(ConfigError::invalid(
                "connection.reconnect",
                "base_ms must be positive and not above cap_ms",
            ));
        }
        if self.give_up_after_secs == Some(0) {
            return Err(ConfigError::invalid(
                "connection.give_up_after_secs",
                "must be positive (use null to retry forever)",
            ));
        }
        Ok(())
    }
}

impl DeliverySettings {
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn dead_letter_queue(&self, queue: &str) -> Option<String> {
        self.dead_letter_suffix
            .as_ref()
            .map(|suffix| format!("{}{}", queue, suffix))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prefetch_limit == 0 {
            return Err(ConfigError::invalid(
                "delivery.prefetch_limit",
                "must be at least 1, unlimited prefetch disables backpressure",
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("delivery.max_attempts", "must be at least 1"));
        }
        if self.processing_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "delivery.processing_timeout_ms",
                "must be positive",
            ));
        }
        if self.retention() <= self.processing_timeout() {
            return Err(ConfigError::invalid(
                "delivery.retention_secs",
                "must be longer than the processing timeout",
            ));
        }
        if matches!(self.dead_letter_suffix.as_deref(), Some("")) {
            return Err(ConfigError::invalid(
                "delivery.dead_letter_suffix",
                "must not be empty, the dead-letter queue would be the queue itself",
            ));
        }
        Ok(())
    }
}

impl RabbitConfig {
    pub fn new(uri: &str) -> Self {
        Self {
            connection: ConnectionSettings::new(uri),
            delivery: DeliverySettings::default(),
            queues: HashMap::new(),
        }
    }

    pub fn with_queue(mut self, channel: &str, queue: &str) -> Self {
        self.queues.insert(channel.to_uppercase(), queue.to_string());
        self
    }

    /// Queue bound to a logical channel such as `billing`.
    pub fn queue(&self, channel: &str) -> Result<&str, ConfigError> {
        self.queues
            .get(&channel.to_uppercase())
            .map(String::as_str)
            .ok_or_else(|| ConfigError::UnknownQueue(channel.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection.validate()?;
        self.delivery.validate()?;
        for (channel, queue) in &self.queues {
            if queue.trim().is_empty() {
                return Err(ConfigError::invalid(
                    &format!("queues.{}", channel),
                    "queue name must not be empty",
                ));
            }
        }
        Ok(())
    }
}

// Configuration loading functions
pub fn find_config_file() -> Option<PathBuf> {
    let locations = [
        ("Current directory", Path::new("rmq_delivery.json")),
        ("Current directory (alternative)", Path::new("config/rmq_delivery.json")),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Some(path.to_path_buf());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(".rmq_delivery.json");
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Some(home_config);
        }
    }

    None
}

/// Reads a JSON config file. Validation is left to the caller since
/// environment overrides are applied on top.
pub fn load_config_file(path: &Path) -> Result<RabbitConfig, ConfigError> {
    let file_error = |reason: String| ConfigError::File {
        path: path.display().to_string(),
        reason,
    };

    let content = fs::read_to_string(path).map_err(|e| file_error(e.to_string()))?;
    serde_json::from_str(&content).map_err(|e| file_error(e.to_string()))
}
