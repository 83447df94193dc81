//! Backend configuration types.

use std::time::Duration;

use serde::Deserialize;

use crate::dlq::DEAD_LETTER_TOPIC;

/// Kafka-family backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// Broker addresses (`host:port`, optionally `kafka://host:port`).
    pub brokers: Vec<String>,
    /// Partitions for auto-created topics; bounds readers per topic.
    pub partitions: i32,
    /// Replication factor for auto-created topics.
    pub replication_factor: i32,
    /// Seconds between stats reports per reader/writer (0 disables).
    pub stats_period_secs: u64,
    /// How long a subscribe waits for a free reader before growing the pool.
    pub reader_acquire_timeout_ms: u64,
    /// Consumer session timeout.
    pub session_timeout_ms: u64,
    /// Dead-letter topic name (namespace is applied on top).
    pub dead_letter_topic: String,
    /// SASL username (optional, for authenticated clusters).
    pub sasl_username: Option<String>,
    /// SASL password (optional, for authenticated clusters).
    pub sasl_password: Option<String>,
    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512).
    pub sasl_mechanism: Option<String>,
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL).
    pub security_protocol: Option<String>,
    /// SSL CA certificate path (for SSL connections).
    pub ssl_ca_location: Option<String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            partitions: 3,
            replication_factor: 1,
            stats_period_secs: 60,
            reader_acquire_timeout_ms: 500,
            session_timeout_ms: 10_000,
            dead_letter_topic: DEAD_LETTER_TOPIC.to_string(),
            sasl_username: None,
            sasl_password: None,
            sasl_mechanism: None,
            security_protocol: None,
            ssl_ca_location: None,
        }
    }
}

impl KafkaConfig {
    /// Config for the given brokers with defaults elsewhere.
    pub fn new(brokers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            brokers: brokers.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Add SASL authentication.
    pub fn with_sasl(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        mechanism: impl Into<String>,
    ) -> Self {
        self.sasl_username = Some(username.into());
        self.sasl_password = Some(password.into());
        self.sasl_mechanism = Some(mechanism.into());
        self.security_protocol = Some("SASL_SSL".to_string());
        self
    }

    /// Set security protocol.
    pub fn with_security_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.security_protocol = Some(protocol.into());
        self
    }

    /// Set SSL CA certificate location.
    pub fn with_ssl_ca(mut self, ca_location: impl Into<String>) -> Self {
        self.ssl_ca_location = Some(ca_location.into());
        self
    }

    pub fn with_partitions(mut self, partitions: i32) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn with_stats_period(mut self, period: Duration) -> Self {
        self.stats_period_secs = period.as_secs();
        self
    }

    pub fn with_reader_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.reader_acquire_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn stats_period(&self) -> Duration {
        Duration::from_secs(self.stats_period_secs)
    }

    pub fn reader_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.reader_acquire_timeout_ms)
    }
}

/// NATS backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// Server URL.
    pub url: String,
    /// Connection name reported to the server.
    pub name: Option<String>,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            name: None,
        }
    }
}

/// In-process backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Queue capacity per consumer group.
    pub capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}
