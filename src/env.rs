use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use dotenv::dotenv;
use tracing::info;

use crate::config::{self, RabbitConfig};
use crate::rabbitmq::errors::ConfigError;

const URI_VAR: &str = "RABBIT_MQ_URI";
const CONFIG_FILE_VAR: &str = "RABBIT_MQ_CONFIG";
const QUEUE_PREFIX: &str = "RABBIT_MQ_";
const QUEUE_SUFFIX: &str = "_QUEUE";

/// Loads `.env`, an optional JSON config file, then environment overrides,
/// and validates the result.
pub fn load() -> Result<RabbitConfig, ConfigError> {
    dotenv().ok();

    let file = match env::var(CONFIG_FILE_VAR) {
        Ok(path) => Some(PathBuf::from(path)),
        Err(_) => config::find_config_file(),
    };

    let base = match file {
        Some(path) => {
            info!("Loading RabbitMQ configuration from {}", path.display());
            Some(config::load_config_file(&path)?)
        }
        None => None,
    };

    from_vars(base, env::vars())
}

/// Applies `RABBIT_MQ_*` variables on top of `base`.
pub fn from_vars<I>(base: Option<RabbitConfig>, vars: I) -> Result<RabbitConfig, ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let vars: Vec<(String, String)> = vars.into_iter().collect();
    let lookup = |key: &str| {
        vars.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.trim().to_string())
    };

    let mut config = match (base, lookup(URI_VAR)) {
        (Some(mut config), Some(uri)) => {
            config.connection.uri = uri;
            config
        }
        (Some(config), None) => config,
        (None, Some(uri)) => RabbitConfig::new(&uri),
        (None, None) => return Err(ConfigError::Missing(URI_VAR.to_string())),
    };

    let delivery = &mut config.delivery;
    if let Some(value) = lookup("RABBIT_MQ_PREFETCH_COUNT") {
        delivery.prefetch_limit = parse("RABBIT_MQ_PREFETCH_COUNT", &value)?;
    }
    if let Some(value) = lookup("RABBIT_MQ_MAX_ATTEMPTS") {
        delivery.max_attempts = parse("RABBIT_MQ_MAX_ATTEMPTS", &value)?;
    }
    if let Some(value) = lookup("RABBIT_MQ_PROCESSING_TIMEOUT_SECS") {
        let secs: u64 = parse("RABBIT_MQ_PROCESSING_TIMEOUT_SECS", &value)?;
        delivery.processing_timeout_ms = secs.saturating_mul(1000);
    }
    if let Some(value) = lookup("RABBIT_MQ_REQUEUE_DELAY_MS") {
        delivery.requeue_delay_ms = parse("RABBIT_MQ_REQUEUE_DELAY_MS", &value)?;
    }
    if let Some(value) = lookup("RABBIT_MQ_RETENTION_SECS") {
        delivery.retention_secs = parse("RABBIT_MQ_RETENTION_SECS", &value)?;
    }
    if let Some(value) = lookup("RABBIT_MQ_CONFIRM_DELIVERY") {
        delivery.confirm_delivery = parse_bool("RABBIT_MQ_CONFIRM_DELIVERY", &value)?;
    }
    if let Some(value) = lookup("RABBIT_MQ_DEAD_LETTER_SUFFIX") {
        delivery.dead_letter_suffix = match value.as_str() {
            "" | "none" => None,
            suffix => Some(suffix.to_string()),
        };
    }
    if let Some(value) = lookup("RABBIT_MQ_CONNECT_GIVE_UP_SECS") {
        config.connection.give_up_after_secs = match value.as_str() {
            "never" => None,
            secs => Some(parse("RABBIT_MQ_CONNECT_GIVE_UP_SECS", secs)?),
        };
    }

    for (key, value) in &vars {
        if let Some(channel) = queue_channel(key) {
            config.queues.insert(channel.to_string(), value.trim().to_string());
        }
    }

    config.validate()?;
    Ok(config)
}

/// `RABBIT_MQ_BILLING_QUEUE` names the `BILLING` channel.
fn queue_channel(key: &str) -> Option<&str> {
    key.strip_prefix(QUEUE_PREFIX)?
        .strip_suffix(QUEUE_SUFFIX)
        .filter(|channel| !channel.is_empty())
}

fn parse<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e| ConfigError::invalid(key, e))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::invalid(key, format!("'{}' is not a boolean", other))),
    }
}
