//! Application configuration.
//!
//! Aggregates messaging, storage, and snapshot settings into a single
//! `Config` that loads from YAML files and environment variables. The core
//! never reads the environment itself; connection details reach buses and
//! stores through resolver functions, and the config sections here exist to
//! build those resolvers conveniently.

use serde::Deserialize;

use crate::repository::DEFAULT_SNAPSHOT_INTERVAL;
use crate::{static_resolver, ConnectionStringResolver};

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Messaging configuration.
    pub messaging: MessagingConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Versions divisible by this trigger a snapshot at save time.
    pub snapshot_interval: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            messaging: MessagingConfig::default(),
            storage: StorageConfig::default(),
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Sources, later overriding earlier:
    /// 1. `config.yaml` in the current directory (if present)
    /// 2. the file named by `EVENTUM_CONFIG` (if set)
    /// 3. environment variables with the `EVENTUM_` prefix (`__` separator)
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new("config", FileFormat::Yaml).required(false))
            .add_source(File::new("config.yaml", FileFormat::Yaml).required(false));

        if let Ok(config_path) = std::env::var("EVENTUM_CONFIG") {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("EVENTUM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

/// Messaging type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// AMQP/RabbitMQ messaging.
    #[default]
    Amqp,
    /// In-memory channels (single process only).
    Memory,
}

/// Messaging configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// AMQP-specific configuration.
    pub amqp: AmqpBusConfig,
}

/// AMQP-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpBusConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Service name: consumer queue name and command routing key.
    pub service: String,
    /// Topic exchange for commands.
    pub command_exchange: String,
    /// Fanout exchange for events.
    pub event_exchange: String,
    /// Consumer workers per receiver.
    pub listener_count: usize,
}

impl Default for AmqpBusConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            service: "eventum".to_string(),
            command_exchange: "cqrs.commands".to_string(),
            event_exchange: "cqrs.events".to_string(),
            listener_count: 1,
        }
    }
}

impl AmqpBusConfig {
    /// A resolver that always returns the configured URL. Deployments with
    /// rotating credentials supply their own resolver instead.
    pub fn resolver(&self) -> ConnectionStringResolver {
        static_resolver(&self.url)
    }
}

/// Storage type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// In-memory store (single process only).
    #[default]
    Memory,
    /// PostgreSQL storage.
    Postgres,
    /// Redis storage (portable key-value layout).
    Redis,
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage type discriminator.
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    /// PostgreSQL-specific configuration.
    pub postgres: PostgresConfig,
    /// Redis-specific configuration.
    pub redis: RedisConfig,
}

/// PostgreSQL-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    /// Connection URI.
    pub uri: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            uri: "postgres://postgres@localhost/eventum".to_string(),
        }
    }
}

impl PostgresConfig {
    pub fn resolver(&self) -> ConnectionStringResolver {
        static_resolver(&self.uri)
    }
}

/// Redis-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Connection URI.
    pub uri: String,
    /// Key prefix for aggregate streams.
    pub prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            uri: "redis://localhost:6379".to_string(),
            prefix: "eventstore".to_string(),
        }
    }
}

impl RedisConfig {
    pub fn resolver(&self) -> ConnectionStringResolver {
        static_resolver(&self.uri)
    }
}
