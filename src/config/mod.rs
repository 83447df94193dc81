//! Application configuration.
//!
//! Aggregates the namespace and every backend section into a single Config
//! struct that can be loaded from YAML files or environment variables.

mod messaging;

pub use messaging::{ChannelConfig, KafkaConfig, NatsConfig};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "mqroute.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "MQROUTE_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "MQROUTE";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "MQROUTE_LOG";

use serde::Deserialize;

/// Main configuration.
///
/// A backend is enabled by the presence of its section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Prefix applied to every topic.
    pub namespace: Option<String>,
    /// Kafka-family backend (`kafka://`).
    pub kafka: Option<KafkaConfig>,
    /// NATS backend (`nats://`).
    pub nats: Option<NatsConfig>,
    /// In-process backend (`mem://`).
    pub channel: Option<ChannelConfig>,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `mqroute.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ::config::ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Config with only the in-process backend, for tests and local runs.
    pub fn in_process() -> Self {
        Self {
            channel: Some(ChannelConfig::default()),
            ..Self::default()
        }
    }
}
