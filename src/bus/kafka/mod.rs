//! Kafka backend with pooled readers.
//!
//! Subscriptions borrow a [`reader::Reader`] from a per-topic pool instead
//! of owning a consumer. The pool for a topic holds at most one reader per
//! partition.
//!
//! - At-least-once: one reader group per topic. Every reader joins its own
//!   broker consumer group (`{base}-{uuid}`), so each subscriber sees every
//!   message.
//! - At-most-once: one reader group per (topic, group id). Readers share
//!   the broker consumer group and split the partitions between them.
//!   Without an explicit id the topic name is the group.
//!
//! Topics, including the dead-letter topic, are created on first use.
//! Publishing goes through one cached [`writer::Writer`] per topic.
//!
//! Reader-side maps and the writer map sit behind separate locks so publish
//! never waits on subscribe.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub mod broker;
pub mod client;
mod id_group;
#[cfg(feature = "kafka")]
mod librdkafka;
mod reader;
mod reader_group;
pub mod stats;
mod writer;

pub use broker::{BrokerAddr, BrokerSet};
pub use client::{BrokerError, LogBroker, LogConsumer, LogProducer, Record, TopicSpec};
#[cfg(feature = "kafka")]
pub use librdkafka::RdKafkaBroker;

use id_group::IdGroup;
use reader_group::{GroupIds, ReaderGroup, ReaderGroupContext};
use stats::{spawn_stats_logger, StatsProvider};
use writer::{LogDeadLetterPublisher, Writer};

use super::{MessageQueue, MqError, Result, Subscription};
use crate::config::KafkaConfig;
use crate::dlq::DeadLetterWriter;
use crate::message::MessageHandler;
use crate::namespace::namespace_topic;
use crate::options::{DeliverySemantics, PubOptions, SubOptions};

#[derive(Default)]
struct ReaderMaps {
    at_least_once: HashMap<String, Arc<ReaderGroup>>,
    at_most_once: HashMap<String, Arc<IdGroup>>,
}

/// Kafka message queue.
pub struct KafkaQueue {
    config: KafkaConfig,
    brokers: BrokerSet,
    broker: Arc<dyn LogBroker>,
    readers: Mutex<ReaderMaps>,
    writers: Mutex<HashMap<String, Arc<Writer>>>,
    dead_letter: DeadLetterWriter,
    shutdown: CancellationToken,
}

impl KafkaQueue {
    /// Create a queue over `broker`, creating the dead-letter topic.
    pub async fn new(config: KafkaConfig, broker: Arc<dyn LogBroker>) -> Result<Self> {
        let brokers = BrokerSet::parse(&config.brokers)?;

        let dead_letter_topic = namespace_topic(&config.dead_letter_topic);
        create_topic(broker.as_ref(), &brokers, &config, &dead_letter_topic).await?;
        let producer = broker.producer(&dead_letter_topic)?;
        let dead_letter = DeadLetterWriter::new(Arc::new(LogDeadLetterPublisher::new(
            dead_letter_topic.clone(),
            producer,
        )));

        info!(
            brokers = %brokers.joined(),
            dead_letter_topic = %dead_letter_topic,
            "Kafka queue ready"
        );

        Ok(Self {
            config,
            brokers,
            broker,
            readers: Mutex::new(ReaderMaps::default()),
            writers: Mutex::new(HashMap::new()),
            dead_letter,
            shutdown: CancellationToken::new(),
        })
    }

    /// Connect to the cluster named by `config.brokers` through librdkafka.
    #[cfg(feature = "kafka")]
    pub async fn connect(config: KafkaConfig) -> Result<Self> {
        let broker = RdKafkaBroker::new(&config)?;
        Self::new(config, Arc::new(broker)).await
    }

    pub fn dead_letter(&self) -> &DeadLetterWriter {
        &self.dead_letter
    }

    /// Create `topic` if needed and return its partition count.
    async fn ensure_topic(&self, topic: &str) -> Result<usize> {
        create_topic(self.broker.as_ref(), &self.brokers, &self.config, topic).await?;
        let partitions = self.broker.partition_count(topic).await?;
        Ok(partitions)
    }

    fn group_context(&self) -> ReaderGroupContext {
        ReaderGroupContext {
            broker: Arc::clone(&self.broker),
            dead_letter: self.dead_letter.clone(),
            acquire_timeout: self.config.reader_acquire_timeout(),
            stats_period: self.config.stats_period(),
            shutdown: self.shutdown.clone(),
        }
    }

    async fn reader_group(&self, topic: &str, opts: &SubOptions) -> Result<Arc<ReaderGroup>> {
        let mut readers = self.readers.lock().await;

        if opts.semantics() == DeliverySemantics::AtLeastOnce {
            if let Some(group) = readers.at_least_once.get(topic) {
                return Ok(Arc::clone(group));
            }

            let capacity = self.ensure_topic(topic).await?;
            let base = match opts.group_id() {
                "" => topic,
                id => id,
            };
            let group = Arc::new(ReaderGroup::new(
                topic,
                GroupIds::PerReader(base.to_string()),
                capacity,
                self.group_context(),
            ));
            readers
                .at_least_once
                .insert(topic.to_string(), Arc::clone(&group));
            debug!(topic = %topic, capacity, "At-least-once reader group created");
            return Ok(group);
        }

        let ids = Arc::clone(
            readers
                .at_most_once
                .entry(topic.to_string())
                .or_insert_with(|| Arc::new(IdGroup::new())),
        );
        let group_id = opts.group_id();
        match ids.open_reader_group(group_id) {
            Err(MqError::GroupNotFound(_)) => {
                let capacity = self.ensure_topic(topic).await?;
                let group = Arc::new(ReaderGroup::new(
                    topic,
                    GroupIds::Shared(group_id.to_string()),
                    capacity,
                    self.group_context(),
                ));
                ids.add_reader_group(group_id, Arc::clone(&group))?;
                debug!(topic = %topic, group_id = %group_id, capacity, "At-most-once reader group created");
                Ok(group)
            }
            found => found,
        }
    }

    async fn writer(&self, topic: &str) -> Result<Arc<Writer>> {
        let mut writers = self.writers.lock().await;
        if let Some(writer) = writers.get(topic) {
            return Ok(Arc::clone(writer));
        }

        self.ensure_topic(topic).await?;
        let producer = self.broker.producer(topic)?;
        let writer = Arc::new(Writer::new(topic, producer));

        let provider: Weak<dyn StatsProvider> = Arc::downgrade(&writer) as Weak<dyn StatsProvider>;
        spawn_stats_logger(provider, self.config.stats_period(), self.shutdown.clone());

        writers.insert(topic.to_string(), Arc::clone(&writer));
        debug!(topic = %topic, "Writer created");
        Ok(writer)
    }

    #[cfg(test)]
    async fn at_least_once_group(&self, topic: &str) -> Option<Arc<ReaderGroup>> {
        self.readers.lock().await.at_least_once.get(topic).cloned()
    }

    #[cfg(test)]
    async fn id_group(&self, topic: &str) -> Option<Arc<IdGroup>> {
        self.readers.lock().await.at_most_once.get(topic).cloned()
    }
}

impl Drop for KafkaQueue {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Create `topic` through a random broker.
///
/// "Not the controller" and "already exists" both mean the topic is there.
async fn create_topic(
    broker: &dyn LogBroker,
    brokers: &BrokerSet,
    config: &KafkaConfig,
    topic: &str,
) -> Result<()> {
    let spec = TopicSpec {
        name: topic.to_string(),
        partitions: config.partitions,
        replication_factor: config.replication_factor,
    };
    let addr = brokers.random();

    match broker.create_topic(addr, &spec).await {
        Ok(()) => {
            info!(topic = %topic, broker = %addr, partitions = spec.partitions, "Topic created");
            Ok(())
        }
        Err(BrokerError::NotController) | Err(BrokerError::TopicAlreadyExists(_)) => {
            debug!(topic = %topic, "Topic already exists");
            Ok(())
        }
        Err(source) => Err(MqError::TopicCreation {
            topic: topic.to_string(),
            source,
        }),
    }
}

#[async_trait]
impl MessageQueue for KafkaQueue {
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        opts: SubOptions,
    ) -> Result<Box<dyn Subscription>> {
        if topic.is_empty() {
            return Err(MqError::EmptyTopic);
        }
        let topic = namespace_topic(topic);
        let mut opts = opts.resolve(DeliverySemantics::AtMostOnce, &topic)?;

        let group = self.reader_group(&topic, &opts).await?;
        group.subscribe(handler, opts.decoder.take()).await
    }

    async fn publish(&self, topic: &str, mut opts: PubOptions) -> Result<()> {
        if topic.is_empty() {
            return Err(MqError::EmptyTopic);
        }
        if !opts.delay().is_zero() {
            return Err(MqError::Unsupported(
                "Kafka does not support delayed publish".to_string(),
            ));
        }
        let data = opts.take_data()?;
        let topic = namespace_topic(topic);

        let writer = self.writer(&topic).await?;
        writer.write(&data).await
    }
}

#[cfg(test)]
mod tests;
