//! `rdkafka` implementation of the broker client seam.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message as KafkaMessage;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::{debug, info};

use super::broker::{BrokerAddr, BrokerSet};
use super::client::{BrokerError, LogBroker, LogConsumer, LogProducer, Record, TopicSpec};
use crate::bus::Result;
use crate::config::KafkaConfig;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// librdkafka-backed broker client.
pub struct RdKafkaBroker {
    settings: ClientSettings,
    producer: FutureProducer,
}

impl RdKafkaBroker {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let settings = ClientSettings {
            config: config.clone(),
            bootstrap_servers: BrokerSet::parse(&config.brokers)?.joined(),
        };
        let producer = settings
            .build_producer_config()
            .create()
            .map_err(client_error)?;

        info!(bootstrap_servers = %settings.bootstrap_servers, "Connected to Kafka");
        Ok(Self { settings, producer })
    }
}

struct ClientSettings {
    config: KafkaConfig,
    bootstrap_servers: String,
}

impl ClientSettings {
    /// Build a ClientConfig for producers.
    fn build_producer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("message.timeout.ms", "5000");
        config.set("acks", "all");

        self.apply_security_config(&mut config);
        config
    }

    /// Build a ClientConfig for one reader's consumer.
    fn build_consumer_config(&self, group_id: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("group.id", group_id);
        config.set("enable.auto.commit", "false");
        config.set("auto.offset.reset", "earliest");
        config.set(
            "session.timeout.ms",
            self.config.session_timeout_ms.to_string(),
        );

        self.apply_security_config(&mut config);
        config
    }

    /// Admin client talking to one specific broker.
    fn build_admin_config(&self, broker: &BrokerAddr) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", broker.to_string());

        self.apply_security_config(&mut config);
        config
    }

    /// Apply security settings to a ClientConfig.
    fn apply_security_config(&self, config: &mut ClientConfig) {
        if let Some(ref protocol) = self.config.security_protocol {
            config.set("security.protocol", protocol);
        }

        if let Some(ref mechanism) = self.config.sasl_mechanism {
            config.set("sasl.mechanism", mechanism);
        }

        if let Some(ref username) = self.config.sasl_username {
            config.set("sasl.username", username);
        }

        if let Some(ref password) = self.config.sasl_password {
            config.set("sasl.password", password);
        }

        if let Some(ref ca_location) = self.config.ssl_ca_location {
            config.set("ssl.ca.location", ca_location);
        }
    }
}

fn client_error(e: KafkaError) -> BrokerError {
    BrokerError::Client(e.to_string())
}

#[async_trait]
impl LogBroker for RdKafkaBroker {
    async fn create_topic(
        &self,
        broker: &BrokerAddr,
        spec: &TopicSpec,
    ) -> std::result::Result<(), BrokerError> {
        let admin: AdminClient<DefaultClientContext> = self
            .settings
            .build_admin_config(broker)
            .create()
            .map_err(client_error)?;

        let topic = NewTopic::new(
            &spec.name,
            spec.partitions,
            TopicReplication::Fixed(spec.replication_factor),
        );
        let results = admin
            .create_topics(&[topic], &AdminOptions::new())
            .await
            .map_err(|e| BrokerError::Other(e.to_string()))?;

        for result in results {
            match result {
                Ok(_) => {}
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    return Err(BrokerError::TopicAlreadyExists(name))
                }
                Err((_, RDKafkaErrorCode::NotController)) => {
                    return Err(BrokerError::NotController)
                }
                Err((name, code)) => {
                    return Err(BrokerError::Other(format!("{}: {}", name, code)))
                }
            }
        }
        Ok(())
    }

    async fn partition_count(&self, topic: &str) -> std::result::Result<usize, BrokerError> {
        let producer = self.producer.clone();
        let name = topic.to_string();

        tokio::task::spawn_blocking(move || {
            let metadata = producer
                .client()
                .fetch_metadata(Some(name.as_str()), METADATA_TIMEOUT)
                .map_err(|e| BrokerError::Other(e.to_string()))?;
            metadata
                .topics()
                .iter()
                .find(|t| t.name() == name)
                .map(|t| t.partitions().len())
                .ok_or(BrokerError::UnknownTopic(name))
        })
        .await
        .map_err(|e| BrokerError::Other(e.to_string()))?
    }

    fn consumer(
        &self,
        topic: &str,
        group_id: &str,
    ) -> std::result::Result<Arc<dyn LogConsumer>, BrokerError> {
        let consumer: StreamConsumer = self
            .settings
            .build_consumer_config(group_id)
            .create()
            .map_err(client_error)?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| BrokerError::Other(e.to_string()))?;

        debug!(topic = %topic, group_id = %group_id, "Kafka consumer subscribed");
        Ok(Arc::new(RdKafkaConsumer {
            consumer: Arc::new(consumer),
        }))
    }

    fn producer(&self, topic: &str) -> std::result::Result<Arc<dyn LogProducer>, BrokerError> {
        Ok(Arc::new(RdKafkaProducer {
            topic: topic.to_string(),
            producer: self.producer.clone(),
        }))
    }
}

struct RdKafkaConsumer {
    consumer: Arc<StreamConsumer>,
}

#[async_trait]
impl LogConsumer for RdKafkaConsumer {
    async fn fetch(&self) -> std::result::Result<Record, BrokerError> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| BrokerError::Other(e.to_string()))?;

        Ok(Record {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        })
    }

    async fn commit(&self, record: &Record) -> std::result::Result<(), BrokerError> {
        let mut positions = TopicPartitionList::new();
        positions
            .add_partition_offset(&record.topic, record.partition, Offset::Offset(record.offset + 1))
            .map_err(|e| BrokerError::Other(e.to_string()))?;

        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.commit(&positions, CommitMode::Sync))
            .await
            .map_err(|e| BrokerError::Other(e.to_string()))?
            .map_err(|e| BrokerError::Other(e.to_string()))
    }
}

struct RdKafkaProducer {
    topic: String,
    producer: FutureProducer,
}

#[async_trait]
impl LogProducer for RdKafkaProducer {
    async fn send(
        &self,
        key: Option<&[u8]>,
        payload: &[u8],
    ) -> std::result::Result<(), BrokerError> {
        let mut record: FutureRecord<'_, [u8], [u8]> =
            FutureRecord::to(&self.topic).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }

        self.producer
            .send(record, SEND_TIMEOUT)
            .await
            .map(|_| ())
            .map_err(|(e, _)| BrokerError::Other(format!("Failed to publish: {}", e)))
    }
}
