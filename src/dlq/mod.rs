//! Dead letter infrastructure.
//!
//! Messages a consumer gives up on (`NackPersistentFailure`) are salvaged
//! to a side topic for offline inspection instead of being lost or retried
//! forever.
//!
//! ## Topic Naming
//!
//! The dead-letter topic is `dead-letter`, namespace applied, unless a
//! subscription names its own.
//!
//! ## Delivery
//!
//! [`DeadLetterWriter::write`] is fire-and-forget: the write runs in its own
//! task bounded by [`DEAD_LETTER_WRITE_TIMEOUT`] and is never retried. A
//! failed write is logged and counted, nothing more.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::namespace::namespace_topic;

/// Dead-letter topic name before namespacing.
pub const DEAD_LETTER_TOPIC: &str = "dead-letter";

/// Upper bound on one dead-letter write.
pub const DEAD_LETTER_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Namespaced dead-letter topic.
pub fn dead_letter_topic() -> String {
    namespace_topic(DEAD_LETTER_TOPIC)
}

/// Errors that can occur during dead-letter operations.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("Failed to publish to dead letter topic: {0}")]
    PublishFailed(String),

    #[error("Dead letter write timed out after {0:?}")]
    Timeout(Duration),
}

/// Transport for dead-letter payloads.
#[async_trait]
pub trait DeadLetterPublisher: Send + Sync {
    /// Persist one payload.
    async fn publish(&self, payload: Vec<u8>) -> Result<(), DlqError>;

    /// Topic the payloads end up in.
    fn topic(&self) -> &str;
}

/// Best-effort, non-blocking dead-letter sink.
#[derive(Clone)]
pub struct DeadLetterWriter {
    publisher: Arc<dyn DeadLetterPublisher>,
    timeout: Duration,
    dropped: Arc<AtomicU64>,
}

impl DeadLetterWriter {
    pub fn new(publisher: Arc<dyn DeadLetterPublisher>) -> Self {
        Self {
            publisher,
            timeout: DEAD_LETTER_WRITE_TIMEOUT,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Override the per-write timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn topic(&self) -> &str {
        self.publisher.topic()
    }

    /// Writes that failed or timed out.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Hand `payload` to a detached task; returns immediately.
    pub fn write(&self, payload: Vec<u8>) {
        let publisher = Arc::clone(&self.publisher);
        let dropped = Arc::clone(&self.dropped);
        let timeout = self.timeout;

        tokio::spawn(async move {
            let size = payload.len();
            let result = match tokio::time::timeout(timeout, publisher.publish(payload)).await {
                Ok(result) => result,
                Err(_) => Err(DlqError::Timeout(timeout)),
            };
            match result {
                Ok(()) => debug!(topic = %publisher.topic(), size, "Dead letter written"),
                Err(e) => {
                    dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(topic = %publisher.topic(), size, error = %e, "Dead letter dropped");
                }
            }
        });
    }
}

/// In-memory dead-letter publisher using a channel.
///
/// Useful for tests and for applications that want to inspect dead letters
/// in-process.
pub struct ChannelDeadLetterPublisher {
    topic: String,
    sender: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelDeadLetterPublisher {
    /// Create the publisher and the receiver dead letters arrive on.
    pub fn new(topic: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                topic: topic.into(),
                sender,
            },
            receiver,
        )
    }
}

#[async_trait]
impl DeadLetterPublisher for ChannelDeadLetterPublisher {
    async fn publish(&self, payload: Vec<u8>) -> Result<(), DlqError> {
        info!(topic = %self.topic, size = payload.len(), "Publishing to channel dead letter");
        self.sender
            .send(payload)
            .map_err(|e| DlqError::PublishFailed(e.to_string()))
    }

    fn topic(&self) -> &str {
        &self.topic
    }
}
