use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::types::MAX_CHANNELS;

/// Which anomaly predicate the dispatcher is built with
#[derive(Debug, Clone, PartialEq)]
pub enum ClassifierKind {
    /// Mean of the leading `window` values compared against `threshold`
    Threshold { threshold: f64, window: usize },
    /// Logistic model loaded from a JSON file
    Model { path: PathBuf },
}

/// Service configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Host of the feed publisher
    pub broker_host: String,
    /// Port of the feed publisher
    pub broker_port: u16,
    /// Topic carrying reading messages
    pub topic: String,
    /// Connect attempts before startup fails
    pub connect_attempts: u32,
    /// Bound on a single connect attempt
    pub connect_timeout: Duration,
    /// First reconnect delay; doubles on each failure
    pub reconnect_base_delay: Duration,
    /// Ceiling for the reconnect delay
    pub reconnect_max_delay: Duration,
    /// Reconnect after this long without a message (None disables)
    pub feed_idle_timeout: Option<Duration>,
    /// Expected channels per reading (None accepts any non-empty arity)
    pub channel_count: Option<usize>,
    /// Capacity of the receive → dispatch queue
    pub dispatch_queue_capacity: usize,
    /// Capacity of each viewer's outbound queue
    pub viewer_queue_capacity: usize,
    /// Maximum time a single WebSocket write may take
    pub viewer_send_timeout: Duration,
    /// Whether positive classifications are pushed to alert viewers
    pub alerts_enabled: bool,
    /// Anomaly predicate selection
    pub classifier: ClassifierKind,
    /// PostgreSQL URL; readings are kept in memory when unset
    pub database_url: Option<String>,
    /// Samples kept by the in-memory store before the oldest are evicted
    pub memory_store_capacity: usize,
    /// PostgreSQL pool size
    pub db_max_connections: u32,
    /// HTTP listen address
    pub bind_addr: String,
    /// How long `stop` waits for the receive task
    pub shutdown_grace: Duration,
}

impl IngestConfig {
    /// Load configuration from environment variables (and `.env` if present)
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let broker_port: u16 = parse_or(&lookup, "BROKER_PORT", 5556)?;
        if broker_port == 0 {
            return Err(ConfigError::InvalidValue(
                "BROKER_PORT must be non-zero".to_string(),
            ));
        }

        let topic = lookup("FEED_TOPIC").unwrap_or_else(|| "eeg/data".to_string());
        if topic.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "FEED_TOPIC must not be empty".to_string(),
            ));
        }

        let connect_attempts: u32 = parse_or(&lookup, "BROKER_CONNECT_ATTEMPTS", 5)?;
        if connect_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "BROKER_CONNECT_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        let connect_timeout_ms: u64 = parse_or(&lookup, "BROKER_CONNECT_TIMEOUT_MS", 5000)?;
        if connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "BROKER_CONNECT_TIMEOUT_MS must be positive".to_string(),
            ));
        }

        let base_ms: u64 = parse_or(&lookup, "RECONNECT_BASE_DELAY_MS", 500)?;
        let max_ms: u64 = parse_or(&lookup, "RECONNECT_MAX_DELAY_MS", 30_000)?;
        if base_ms == 0 || max_ms < base_ms {
            return Err(ConfigError::InvalidValue(
                "RECONNECT_BASE_DELAY_MS must be positive and not exceed RECONNECT_MAX_DELAY_MS"
                    .to_string(),
            ));
        }

        let idle_secs: u64 = parse_or(&lookup, "FEED_IDLE_TIMEOUT_SECS", 10)?;

        let channel_count: usize = parse_or(&lookup, "CHANNEL_COUNT", 8)?;
        if channel_count > MAX_CHANNELS {
            return Err(ConfigError::InvalidValue(format!(
                "CHANNEL_COUNT must be at most {}",
                MAX_CHANNELS
            )));
        }

        let dispatch_queue_capacity: usize = parse_or(&lookup, "DISPATCH_QUEUE_CAPACITY", 1024)?;
        let viewer_queue_capacity: usize = parse_or(&lookup, "VIEWER_QUEUE_CAPACITY", 256)?;
        if dispatch_queue_capacity == 0 || viewer_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "queue capacities must be positive".to_string(),
            ));
        }

        let send_timeout_ms: u64 = parse_or(&lookup, "VIEWER_SEND_TIMEOUT_MS", 2000)?;

        let memory_store_capacity: usize =
            parse_or(&lookup, "MEMORY_STORE_CAPACITY", 100_000)?;
        if memory_store_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "MEMORY_STORE_CAPACITY must be positive".to_string(),
            ));
        }

        Ok(Self {
            broker_host: lookup("BROKER_HOST").unwrap_or_else(|| "localhost".to_string()),
            broker_port,
            topic,
            connect_attempts,
            connect_timeout: Duration::from_millis(connect_timeout_ms),
            reconnect_base_delay: Duration::from_millis(base_ms),
            reconnect_max_delay: Duration::from_millis(max_ms),
            feed_idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            channel_count: (channel_count > 0).then_some(channel_count),
            dispatch_queue_capacity,
            viewer_queue_capacity,
            viewer_send_timeout: Duration::from_millis(send_timeout_ms),
            alerts_enabled: parse_flag(&lookup, "ALERTS_ENABLED", true)?,
            classifier: classifier_from_vars(&lookup)?,
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            memory_store_capacity,
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", 10)?,
            bind_addr: lookup("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8000".to_string()),
            shutdown_grace: Duration::from_secs(parse_or(&lookup, "SHUTDOWN_GRACE_SECS", 5)?),
        })
    }

    /// ZeroMQ endpoint of the feed publisher
    pub fn broker_endpoint(&self) -> String {
        format!("tcp://{}:{}", self.broker_host, self.broker_port)
    }
}

fn classifier_from_vars<F>(lookup: &F) -> Result<ClassifierKind, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let kind = lookup("CLASSIFIER").unwrap_or_else(|| "threshold".to_string());
    match kind.to_lowercase().as_str() {
        "threshold" => {
            let threshold: f64 = parse_or(lookup, "SEIZURE_THRESHOLD", 5.0)?;
            let window: usize = parse_or(lookup, "SEIZURE_WINDOW", 8)?;
            if !threshold.is_finite() || window == 0 {
                return Err(ConfigError::InvalidValue(
                    "SEIZURE_THRESHOLD must be finite and SEIZURE_WINDOW positive".to_string(),
                ));
            }
            Ok(ClassifierKind::Threshold { threshold, window })
        }
        "model" => {
            let path = lookup("CLASSIFIER_MODEL_PATH")
                .ok_or_else(|| ConfigError::MissingEnvVar("CLASSIFIER_MODEL_PATH".to_string()))?;
            Ok(ClassifierKind::Model {
                path: PathBuf::from(path),
            })
        }
        other => Err(ConfigError::InvalidValue(format!(
            "unknown CLASSIFIER '{}' (expected 'threshold' or 'model')",
            other
        ))),
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{} has invalid value '{}'", key, raw))),
        None => Ok(default),
    }
}

fn parse_flag<F>(lookup: &F, key: &str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue(format!(
            "{} has invalid value '{}' (expected true/false)",
            key, raw
        ))),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}
