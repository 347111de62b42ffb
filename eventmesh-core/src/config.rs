use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::models::ServerId;
use crate::{Error, Result};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub broker: BrokerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Unique identifier for this instance. Generated when not set.
    pub id: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { id: None }
    }
}

impl ServerConfig {
    /// Resolve the configured server ID, generating one if absent
    #[must_use]
    pub fn server_id(&self) -> ServerId {
        self.id
            .clone()
            .map_or_else(ServerId::generate, ServerId::from_string)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis connection URL. Empty runs the broker in single-instance
    /// in-memory mode.
    pub url: String,
    pub key_prefix: String,
    pub connect_timeout_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "eventmesh:".to_string(),
            connect_timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Capacity of each client's outbound event queue
    pub queue_capacity: usize,
    /// Interval between synthetic ping events on each connection
    pub heartbeat_interval_secs: u64,
    /// TTL on connection registry records
    pub connection_ttl_secs: u64,
    /// How often the expiry sweep runs
    pub sweep_interval_secs: u64,
    /// Connections idle past this are reclaimed by the sweep
    pub sweep_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            heartbeat_interval_secs: 10,
            connection_ttl_secs: 300,
            sweep_interval_secs: 60,
            sweep_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from an optional file plus `EVENTMESH__`-prefixed
    /// environment variables (e.g. `EVENTMESH__REDIS__URL`)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }

        builder
            .add_source(Environment::with_prefix("EVENTMESH").separator("__"))
            .build()
            .map_err(|e| Error::Configuration(e.to_string()))?
            .try_deserialize()
            .map_err(|e| Error::Configuration(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.broker.queue_capacity, 100);
        assert_eq!(config.broker.heartbeat_interval_secs, 10);
        assert_eq!(config.broker.connection_ttl_secs, 300);
        assert_eq!(config.redis.key_prefix, "eventmesh:");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_server_id_generated_when_unset() {
        let config = Config::default();
        assert!(config.server.server_id().as_str().starts_with("srv_"));
    }

    #[test]
    fn test_server_id_from_config() {
        let server = ServerConfig {
            id: Some("server-a".to_string()),
        };
        assert_eq!(server.server_id().as_str(), "server-a");
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.broker.sweep_interval_secs, 60);
    }
}
