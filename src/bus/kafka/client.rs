//! Log-broker client seam.
//!
//! The pooling engine talks to the broker only through these traits:
//! administrative topic creation and partition metadata ([`LogBroker`]),
//! partitioned consume-with-commit ([`LogConsumer`]) and produce
//! ([`LogProducer`]). `rdkafka` backs them in production; the in-memory
//! [`crate::bus::MockLogBroker`] backs them in tests.

use std::sync::Arc;

use async_trait::async_trait;

use super::broker::BrokerAddr;

/// Errors reported by a broker client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// The contacted broker is not the cluster controller.
    #[error("Broker is not the controller")]
    NotController,

    #[error("Topic '{0}' already exists")]
    TopicAlreadyExists(String),

    #[error("Unknown topic '{0}'")]
    UnknownTopic(String),

    #[error("Client creation failed: {0}")]
    Client(String),

    #[error("{0}")]
    Other(String),
}

/// Settings for an auto-created topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i32,
}

/// One fetched record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl Record {
    /// Stable id of the record within its topic.
    pub fn id(&self) -> String {
        format!("{}-{}", self.partition, self.offset)
    }
}

/// Administrative and factory access to a partitioned log broker.
#[async_trait]
pub trait LogBroker: Send + Sync {
    /// Create `spec` through `broker`.
    async fn create_topic(&self, broker: &BrokerAddr, spec: &TopicSpec) -> Result<(), BrokerError>;

    /// Number of partitions of an existing topic.
    async fn partition_count(&self, topic: &str) -> Result<usize, BrokerError>;

    /// A consumer of `topic` in consumer group `group_id`.
    fn consumer(&self, topic: &str, group_id: &str) -> Result<Arc<dyn LogConsumer>, BrokerError>;

    /// A producer writing to `topic`.
    fn producer(&self, topic: &str) -> Result<Arc<dyn LogProducer>, BrokerError>;
}

/// Consumer handle owned by one reader.
#[async_trait]
pub trait LogConsumer: Send + Sync {
    /// Wait for the next record. Must be cancel-safe: dropping the future
    /// must not lose a record.
    async fn fetch(&self) -> Result<Record, BrokerError>;

    /// Mark `record` (and everything before it in its partition) consumed.
    async fn commit(&self, record: &Record) -> Result<(), BrokerError>;
}

/// Producer handle for one topic.
#[async_trait]
pub trait LogProducer: Send + Sync {
    async fn send(&self, key: Option<&[u8]>, payload: &[u8]) -> Result<(), BrokerError>;
}
