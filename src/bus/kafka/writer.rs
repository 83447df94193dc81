//! Cached per-topic publish handle.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::client::LogProducer;
use super::stats::{Counter, StatsProvider};
use crate::bus::{MqError, Result};
use crate::dlq::{DeadLetterPublisher, DlqError};

/// Publishes to one topic through one producer handle.
pub(crate) struct Writer {
    topic: String,
    producer: Arc<dyn LogProducer>,
    messages: Counter,
    bytes: Counter,
    failures: Counter,
}

impl Writer {
    pub(crate) fn new(topic: impl Into<String>, producer: Arc<dyn LogProducer>) -> Self {
        Self {
            topic: topic.into(),
            producer,
            messages: Counter::default(),
            bytes: Counter::default(),
            failures: Counter::default(),
        }
    }

    pub(crate) async fn write(&self, payload: &[u8]) -> Result<()> {
        match self.producer.send(None, payload).await {
            Ok(()) => {
                self.messages.incr();
                self.bytes.add(payload.len() as u64);
                debug!(topic = %self.topic, size = payload.len(), "Published");
                Ok(())
            }
            Err(e) => {
                self.failures.incr();
                warn!(topic = %self.topic, error = %e, "Publish failed");
                Err(MqError::Publish(e.to_string()))
            }
        }
    }
}

impl StatsProvider for Writer {
    fn stats_kind(&self) -> &'static str {
        "writer"
    }

    fn stats_topic(&self) -> &str {
        &self.topic
    }

    fn stats_snapshot(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("messages", self.messages.get()),
            ("bytes", self.bytes.get()),
            ("failures", self.failures.get()),
        ]
    }
}

/// Dead-letter transport writing to a dedicated log topic.
pub(crate) struct LogDeadLetterPublisher {
    writer: Writer,
}

impl LogDeadLetterPublisher {
    pub(crate) fn new(topic: impl Into<String>, producer: Arc<dyn LogProducer>) -> Self {
        Self {
            writer: Writer::new(topic, producer),
        }
    }
}

#[async_trait]
impl DeadLetterPublisher for LogDeadLetterPublisher {
    async fn publish(&self, payload: Vec<u8>) -> std::result::Result<(), DlqError> {
        self.writer
            .write(&payload)
            .await
            .map_err(|e| DlqError::PublishFailed(e.to_string()))
    }

    fn topic(&self) -> &str {
        &self.writer.topic
    }
}
