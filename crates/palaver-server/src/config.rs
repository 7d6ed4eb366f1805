//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use palaver_broker::{BrokerMode, LogBrokerConfig};
use palaver_shared::constants;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Which broker implementation to run.
    /// Env: `BROKER_MODE` (`standalone` | `kafka`)
    /// Default: `standalone`
    pub broker_mode: BrokerMode,

    /// Node id stamped into generated message ids (0..1024).
    /// Env: `NODE_ID`
    /// Default: `0`
    pub node_id: u16,

    /// SQLite database path.  Unset means an in-memory database
    /// (history is disposable for that deployment).
    /// Env: `DB_PATH`
    pub db_path: Option<PathBuf>,

    /// Shared inbound queue capacity (standalone mode).
    /// Env: `INBOUND_QUEUE`
    pub inbound_queue: usize,

    /// Login/logout event queue capacity.
    /// Env: `EVENT_QUEUE`
    pub event_queue: usize,

    /// Per-connection outbound queue capacity.
    /// Env: `OUTBOUND_QUEUE`
    pub outbound_queue: usize,

    /// Per-connection overflow buffer size.
    /// Env: `OVERFLOW_BUFFER`
    pub overflow_buffer: usize,

    /// Cache worker pool size.
    /// Env: `CACHE_WORKERS`
    pub cache_workers: usize,

    /// Cache task queue capacity.
    /// Env: `CACHE_TASK_QUEUE`
    pub cache_task_queue: usize,

    /// Cached conversation tail length.
    /// Env: `CONVERSATION_TAIL`
    pub conversation_tail: usize,

    /// Cached conversation tail TTL in seconds.
    /// Env: `CONVERSATION_TTL_SECS`
    pub conversation_ttl_secs: u64,

    // -- Distributed mode --
    /// Kafka bootstrap servers.
    /// Env: `KAFKA_BROKERS`
    /// Default: `127.0.0.1:9092`
    pub kafka_brokers: String,

    /// Kafka topic name.
    /// Env: `KAFKA_TOPIC`
    /// Default: `palaver-messages`
    pub kafka_topic: String,

    /// Consumer group prefix.
    /// Env: `KAFKA_GROUP_PREFIX`
    pub kafka_group_prefix: String,

    /// Partition key for produced records.
    /// Env: `KAFKA_PARTITION_KEY`
    pub kafka_partition_key: String,

    /// Kafka I/O timeout in milliseconds.
    /// Env: `KAFKA_TIMEOUT_MS`
    /// Default: `5000`
    pub kafka_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let log_defaults = LogBrokerConfig::default();
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            broker_mode: BrokerMode::Standalone,
            node_id: 0,
            db_path: None,
            inbound_queue: constants::INBOUND_QUEUE_CAPACITY,
            event_queue: constants::EVENT_QUEUE_CAPACITY,
            outbound_queue: constants::OUTBOUND_QUEUE_CAPACITY,
            overflow_buffer: constants::OVERFLOW_BUFFER_CAPACITY,
            cache_workers: constants::CACHE_WORKERS,
            cache_task_queue: constants::CACHE_TASK_QUEUE_CAPACITY,
            conversation_tail: constants::CONVERSATION_TAIL_LEN,
            conversation_ttl_secs: constants::CONVERSATION_TAIL_TTL_SECS,
            kafka_brokers: log_defaults.brokers,
            kafka_topic: log_defaults.topic,
            kafka_group_prefix: log_defaults.group_prefix,
            kafka_partition_key: log_defaults.partition_key,
            kafka_timeout_ms: log_defaults.timeout.as_millis() as u64,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(mode) = std::env::var("BROKER_MODE") {
            match mode.parse::<BrokerMode>() {
                Ok(parsed) => config.broker_mode = parsed,
                Err(e) => {
                    tracing::warn!(error = %e, "Invalid BROKER_MODE, using standalone");
                }
            }
        }

        if let Ok(val) = std::env::var("NODE_ID") {
            if let Ok(n) = val.parse::<u16>() {
                config.node_id = n;
            }
        }

        if let Ok(path) = std::env::var("DB_PATH") {
            if !path.is_empty() {
                config.db_path = Some(PathBuf::from(path));
            }
        }

        read_usize("INBOUND_QUEUE", &mut config.inbound_queue);
        read_usize("EVENT_QUEUE", &mut config.event_queue);
        read_usize("OUTBOUND_QUEUE", &mut config.outbound_queue);
        read_usize("OVERFLOW_BUFFER", &mut config.overflow_buffer);
        read_usize("CACHE_WORKERS", &mut config.cache_workers);
        read_usize("CACHE_TASK_QUEUE", &mut config.cache_task_queue);
        read_usize("CONVERSATION_TAIL", &mut config.conversation_tail);

        if let Ok(val) = std::env::var("CONVERSATION_TTL_SECS") {
            if let Ok(n) = val.parse::<u64>() {
                config.conversation_ttl_secs = n;
            }
        }

        if let Ok(brokers) = std::env::var("KAFKA_BROKERS") {
            config.kafka_brokers = brokers;
        }
        if let Ok(topic) = std::env::var("KAFKA_TOPIC") {
            config.kafka_topic = topic;
        }
        if let Ok(prefix) = std::env::var("KAFKA_GROUP_PREFIX") {
            config.kafka_group_prefix = prefix;
        }
        if let Ok(key) = std::env::var("KAFKA_PARTITION_KEY") {
            config.kafka_partition_key = key;
        }
        if let Ok(val) = std::env::var("KAFKA_TIMEOUT_MS") {
            if let Ok(n) = val.parse::<u64>() {
                config.kafka_timeout_ms = n;
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    /// The distributed-mode settings as the broker crate consumes them.
    pub fn log_broker_config(&self) -> LogBrokerConfig {
        LogBrokerConfig {
            brokers: self.kafka_brokers.clone(),
            topic: self.kafka_topic.clone(),
            group_prefix: self.kafka_group_prefix.clone(),
            partition_key: self.kafka_partition_key.clone(),
            timeout: Duration::from_millis(self.kafka_timeout_ms),
            event_capacity: self.event_queue,
        }
    }

    pub fn conversation_ttl(&self) -> Duration {
        Duration::from_secs(self.conversation_ttl_secs)
    }
}

fn read_usize(name: &str, target: &mut usize) {
    if let Ok(val) = std::env::var(name) {
        if let Ok(n) = val.parse::<usize>() {
            *target = n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.broker_mode, BrokerMode::Standalone);
        assert!(config.db_path.is_none());
    }

    #[test]
    fn log_config_mirrors_kafka_settings() {
        let mut config = ServerConfig::default();
        config.kafka_topic = "custom-topic".into();
        config.kafka_timeout_ms = 1234;

        let log = config.log_broker_config();
        assert_eq!(log.topic, "custom-topic");
        assert_eq!(log.timeout, Duration::from_millis(1234));
    }
}
