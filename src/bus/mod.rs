//! Broker backends.
//!
//! This module contains:
//! - `MessageQueue` trait: the capability every backend implements
//! - `Subscription` trait: handle returned by `subscribe`
//! - `MqError`: error taxonomy shared by router, options and backends
//! - Implementations: Kafka (pooled readers), in-process channels, NATS
//! - `init_router`: build a `Router` from configuration

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::codec::CodecError;
use crate::config::Config;
use crate::dlq::DlqError;
use crate::message::MessageHandler;
use crate::options::{PubOptions, SubOptions};
use crate::router::{Router, Scheme};

// Implementation modules
pub mod channel;
pub(crate) mod dispatch;
pub mod kafka;
pub mod mock;
#[cfg(feature = "nats")]
pub mod nats;

// Re-exports
pub use channel::ChannelQueue;
pub use kafka::{BrokerError, KafkaQueue};
pub use mock::MockLogBroker;
#[cfg(feature = "nats")]
pub use nats::NatsQueue;

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, MqError>;

/// Errors surfaced by publish/subscribe and by subscriptions.
#[derive(Debug, thiserror::Error)]
pub enum MqError {
    // Configuration
    #[error("Topic must not be empty")]
    EmptyTopic,

    #[error("Cannot parse topic '{0}': expected scheme://name")]
    TopicParse(String),

    #[error("Unsupported queue type '{0}'")]
    UnsupportedScheme(String),

    #[error("No {0} queue configured")]
    NoQueueConfigured(Scheme),

    #[error("Delivery semantics already set")]
    SemanticsAlreadySet,

    #[error("Group id already set")]
    GroupAlreadySet,

    #[error("At-most-once delivery requires a group id")]
    MissingGroupId,

    #[error("Invalid option: {0}")]
    InvalidOption(String),

    #[error("Publish data already set")]
    DataAlreadySet,

    #[error("No publish data set")]
    MissingData,

    #[error("Configuration error: {0}")]
    Config(String),

    // Capacity
    #[error("No readers available for topic '{topic}'")]
    NoReadersAvailable { topic: String },

    // Subscriptions
    #[error("Invalid subscription")]
    InvalidSubscription,

    #[error("Reader group '{0}' not found")]
    GroupNotFound(String),

    #[error("Reader group '{0}' already exists")]
    GroupAlreadyExists(String),

    // Broker interaction
    #[error("Commit failed: {0}")]
    Commit(#[source] BrokerError),

    #[error("Fetch failed: {0}")]
    Fetch(#[source] BrokerError),

    #[error("Cannot create topic '{topic}': {source}")]
    TopicCreation {
        topic: String,
        #[source]
        source: BrokerError,
    },

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    // Protocol
    #[error("Unsupported consumption code {0}")]
    UnsupportedConsumptionCode(i32),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Dead letter error: {0}")]
    DeadLetter(#[from] DlqError),
}

/// Handle for an active subscription.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Topic this subscription consumes, namespace applied.
    fn topic(&self) -> &str;

    /// Stop consuming. The first call succeeds; later calls fail with
    /// [`MqError::InvalidSubscription`].
    async fn unsubscribe(&self) -> Result<()>;
}

/// A broker backend the router can dispatch to.
///
/// Topics arrive without their scheme prefix and without namespace; each
/// backend applies the namespace itself.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        opts: SubOptions,
    ) -> Result<Box<dyn Subscription>>;

    async fn publish(&self, topic: &str, opts: PubOptions) -> Result<()>;
}

/// Build a router with every backend present in the configuration.
///
/// Sets the process-wide namespace first so backends create their topics
/// (including the dead-letter topic) inside it. Kafka and NATS require the
/// `kafka` / `nats` features respectively.
pub async fn init_router(config: &Config) -> Result<Router> {
    if let Some(ref namespace) = config.namespace {
        crate::namespace::set_namespace(namespace.clone());
    }

    let mut router = Router::new();

    if let Some(ref channel) = config.channel {
        router.bind(Scheme::Memory, Arc::new(ChannelQueue::new(channel.clone())));
        info!(queue_type = "mem", "Queue initialized");
    }

    if let Some(ref kafka) = config.kafka {
        #[cfg(feature = "kafka")]
        {
            let queue = KafkaQueue::connect(kafka.clone()).await?;
            router.bind(Scheme::Kafka, Arc::new(queue));
            info!(queue_type = "kafka", "Queue initialized");
        }

        #[cfg(not(feature = "kafka"))]
        {
            let _ = kafka;
            return Err(MqError::Config(
                "Kafka support requires the 'kafka' feature. Rebuild with --features kafka"
                    .to_string(),
            ));
        }
    }

    if let Some(ref nats) = config.nats {
        #[cfg(feature = "nats")]
        {
            let queue = NatsQueue::connect(nats.clone()).await?;
            router.bind(Scheme::Nats, Arc::new(queue));
            info!(queue_type = "nats", "Queue initialized");
        }

        #[cfg(not(feature = "nats"))]
        {
            let _ = nats;
            return Err(MqError::Config(
                "NATS support requires the 'nats' feature. Rebuild with --features nats"
                    .to_string(),
            ));
        }
    }

    Ok(router)
}
