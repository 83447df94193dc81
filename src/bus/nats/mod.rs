//! NATS message queue.
//!
//! Subjects are the namespaced topic names. At-least-once subscriptions use
//! plain subscriptions (every subscriber receives every message);
//! at-most-once subscriptions join a queue group named after the group id.
//!
//! Core NATS has no acknowledgements, so retries, timeouts and dead
//! lettering follow the shared delivery policy. At most `concurrency`
//! handlers run at once per subscription.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dispatch::{dispatch, DeliveryPolicy, Outcome};
use super::{MessageQueue, MqError, Result, Subscription};
use crate::config::NatsConfig;
use crate::dlq::{dead_letter_topic, DeadLetterPublisher, DeadLetterWriter, DlqError};
use crate::message::MessageHandler;
use crate::namespace::namespace_topic;
use crate::options::{DeliverySemantics, PubOptions, SubOptions};
use crate::utils::retry::connection_backoff;

/// NATS message queue.
pub struct NatsQueue {
    client: async_nats::Client,
    shutdown: CancellationToken,
}

impl NatsQueue {
    /// Connect to `config.url`, retrying with backoff.
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let url = config.url.clone();
        let client = (|| {
            let url = url.clone();
            let name = config.name.clone();
            async move {
                let mut options = async_nats::ConnectOptions::new();
                if let Some(name) = name {
                    options = options.name(name);
                }
                options.connect(url).await.map_err(|e| e.to_string())
            }
        })
        .retry(connection_backoff())
        .notify(|err: &String, dur: Duration| {
            warn!(url = %url, error = %err, delay = ?dur, "NATS connection failed, retrying");
        })
        .await
        .map_err(|e| MqError::Config(format!("Cannot connect to NATS at {}: {}", url, e)))?;

        info!(url = %config.url, "Connected to NATS");
        Ok(Self::with_client(client))
    }

    /// Wrap an existing client.
    pub fn with_client(client: async_nats::Client) -> Self {
        Self {
            client,
            shutdown: CancellationToken::new(),
        }
    }

    fn dead_letter_writer(&self, opts: &SubOptions) -> DeadLetterWriter {
        let subject = match opts.dlq_topic() {
            Some(topic) => namespace_topic(topic),
            None => dead_letter_topic(),
        };
        DeadLetterWriter::new(Arc::new(NatsDeadLetterPublisher {
            client: self.client.clone(),
            subject,
        }))
    }
}

impl Drop for NatsQueue {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct NatsDeadLetterPublisher {
    client: async_nats::Client,
    subject: String,
}

#[async_trait]
impl DeadLetterPublisher for NatsDeadLetterPublisher {
    async fn publish(&self, payload: Vec<u8>) -> std::result::Result<(), DlqError> {
        self.client
            .publish(self.subject.clone(), Bytes::from(payload))
            .await
            .map_err(|e| DlqError::PublishFailed(e.to_string()))
    }

    fn topic(&self) -> &str {
        &self.subject
    }
}

#[async_trait]
impl MessageQueue for NatsQueue {
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        opts: SubOptions,
    ) -> Result<Box<dyn Subscription>> {
        if topic.is_empty() {
            return Err(MqError::EmptyTopic);
        }
        let subject = namespace_topic(topic);
        let mut opts = opts.resolve(DeliverySemantics::AtMostOnce, &subject)?;

        let mut subscriber = match opts.semantics() {
            DeliverySemantics::AtLeastOnce => self.client.subscribe(subject.clone()).await,
            _ => {
                self.client
                    .queue_subscribe(subject.clone(), opts.group_id().to_string())
                    .await
            }
        }
        .map_err(|e| MqError::Broker(super::BrokerError::Other(e.to_string())))?;

        let policy = DeliveryPolicy::from_options(&opts, Some(self.dead_letter_writer(&opts)));
        let decoder = opts.decoder.take();
        let limiter = Arc::new(Semaphore::new(opts.concurrency()));
        let cancel = self.shutdown.child_token();

        let loop_cancel = cancel.clone();
        let loop_subject = subject.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    biased;
                    _ = loop_cancel.cancelled() => break,
                    message = subscriber.next() => message,
                };
                let Some(message) = message else {
                    debug!(subject = %loop_subject, "NATS subscription closed");
                    break;
                };

                let Ok(permit) = Arc::clone(&limiter).acquire_owned().await else {
                    break;
                };
                let handler = Arc::clone(&handler);
                let decoder = decoder.clone();
                let policy = policy.clone();
                let cancel = loop_cancel.clone();
                let subject = loop_subject.clone();

                tokio::spawn(async move {
                    let outcome = dispatch(
                        handler.as_ref(),
                        decoder.as_ref(),
                        &policy,
                        Uuid::new_v4().to_string(),
                        &subject,
                        &message.payload,
                    )
                    .await;
                    if outcome == Outcome::Stop {
                        cancel.cancel();
                    }
                    drop(permit);
                });
            }
            let _ = subscriber.unsubscribe().await;
        });

        info!(subject = %subject, semantics = %opts.semantics(), "Subscribed to NATS");
        Ok(Box::new(NatsSubscription {
            subject,
            cancel,
            done: AtomicBool::new(false),
        }))
    }

    async fn publish(&self, topic: &str, mut opts: PubOptions) -> Result<()> {
        if topic.is_empty() {
            return Err(MqError::EmptyTopic);
        }
        if !opts.delay().is_zero() {
            return Err(MqError::Unsupported(
                "NATS does not support delayed publish".to_string(),
            ));
        }
        let data = opts.take_data()?;
        let subject = namespace_topic(topic);

        self.client
            .publish(subject.clone(), Bytes::from(data))
            .await
            .map_err(|e| MqError::Publish(e.to_string()))?;
        debug!(subject = %subject, "Published to NATS");
        Ok(())
    }
}

struct NatsSubscription {
    subject: String,
    cancel: CancellationToken,
    done: AtomicBool,
}

#[async_trait]
impl Subscription for NatsSubscription {
    fn topic(&self) -> &str {
        &self.subject
    }

    async fn unsubscribe(&self) -> Result<()> {
        if self.done.swap(true, Ordering::SeqCst) {
            return Err(MqError::InvalidSubscription);
        }
        self.cancel.cancel();
        Ok(())
    }
}
