//! In-process message queue.
//!
//! Topics live in one process and hold consumer groups. Each group owns a
//! bounded queue drained by the workers of its member subscriptions:
//!
//! - at-least-once subscriptions get a private group, so every subscriber
//!   receives every message;
//! - at-most-once subscriptions with the same group id share one queue, so
//!   each message goes to one of them.
//!
//! Messages published to a topic without groups are dropped. Publish delay
//! is honoured. Dead letters are published back into the queue.
//!
//! `AckFinal` ends the whole subscription: its workers stop and it leaves
//! its group, so publishers never wait on a queue nobody drains.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dispatch::{dispatch, DeliveryPolicy, Outcome};
use super::{MessageQueue, MqError, Result, Subscription};
use crate::config::ChannelConfig;
use crate::dlq::{dead_letter_topic, DeadLetterPublisher, DeadLetterWriter, DlqError};
use crate::message::MessageHandler;
use crate::namespace::namespace_topic;
use crate::options::{DeliverySemantics, PubOptions, SubOptions};

struct Envelope {
    id: String,
    payload: Arc<Vec<u8>>,
}

struct ConsumerGroup {
    sender: mpsc::Sender<Envelope>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Envelope>>>,
    members: usize,
}

/// Topic registry shared by the queue, its workers and delayed publishes.
struct Hub {
    capacity: usize,
    topics: Mutex<HashMap<String, HashMap<String, ConsumerGroup>>>,
    sequence: AtomicU64,
}

impl Hub {
    fn topics(&self) -> MutexGuard<'_, HashMap<String, HashMap<String, ConsumerGroup>>> {
        self.topics.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Join `group` on `topic`, creating it if needed.
    fn join(&self, topic: &str, group: &str) -> Arc<tokio::sync::Mutex<mpsc::Receiver<Envelope>>> {
        let mut topics = self.topics();
        let entry = topics
            .entry(topic.to_string())
            .or_default()
            .entry(group.to_string())
            .or_insert_with(|| {
                let (sender, receiver) = mpsc::channel(self.capacity);
                ConsumerGroup {
                    sender,
                    receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
                    members: 0,
                }
            });
        entry.members += 1;
        Arc::clone(&entry.receiver)
    }

    /// Leave `group`; the last member removes it.
    fn leave(&self, topic: &str, group: &str) {
        let mut topics = self.topics();
        let Some(groups) = topics.get_mut(topic) else {
            return;
        };
        if let Some(entry) = groups.get_mut(group) {
            entry.members = entry.members.saturating_sub(1);
            if entry.members == 0 {
                groups.remove(group);
            }
        }
        if groups.is_empty() {
            topics.remove(topic);
        }
    }

    /// Hand `payload` to every group of `topic`.
    async fn deliver(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let senders: Vec<mpsc::Sender<Envelope>> = self
            .topics()
            .get(topic)
            .map(|groups| groups.values().map(|g| g.sender.clone()).collect())
            .unwrap_or_default();

        if senders.is_empty() {
            debug!(topic = %topic, "No subscribers, message dropped");
            return Ok(());
        }

        let id = self.sequence.fetch_add(1, Ordering::Relaxed).to_string();
        let payload = Arc::new(payload);
        for sender in senders {
            let envelope = Envelope {
                id: id.clone(),
                payload: Arc::clone(&payload),
            };
            // a group whose last member just left has closed its queue
            if sender.send(envelope).await.is_err() {
                debug!(topic = %topic, "Consumer group gone");
            }
        }
        Ok(())
    }
}

/// One subscription's membership of a consumer group; leaves at most once.
struct Membership {
    hub: Arc<Hub>,
    topic: String,
    group: String,
    joined: AtomicBool,
}

impl Membership {
    fn leave(&self) {
        if self.joined.swap(false, Ordering::SeqCst) {
            self.hub.leave(&self.topic, &self.group);
        }
    }
}

/// Dead-letter transport publishing into the in-process queue.
struct TopicDeadLetterPublisher {
    hub: Arc<Hub>,
    topic: String,
}

#[async_trait]
impl DeadLetterPublisher for TopicDeadLetterPublisher {
    async fn publish(&self, payload: Vec<u8>) -> std::result::Result<(), DlqError> {
        self.hub
            .deliver(&self.topic, payload)
            .await
            .map_err(|e| DlqError::PublishFailed(e.to_string()))
    }

    fn topic(&self) -> &str {
        &self.topic
    }
}

/// In-process message queue.
pub struct ChannelQueue {
    hub: Arc<Hub>,
    shutdown: CancellationToken,
}

impl ChannelQueue {
    pub fn new(config: ChannelConfig) -> Self {
        info!(capacity = config.capacity, "Channel queue initialized");
        Self {
            hub: Arc::new(Hub {
                capacity: config.capacity.max(1),
                topics: Mutex::new(HashMap::new()),
                sequence: AtomicU64::new(0),
            }),
            shutdown: CancellationToken::new(),
        }
    }

    fn dead_letter_writer(&self, opts: &SubOptions) -> DeadLetterWriter {
        let topic = match opts.dlq_topic() {
            Some(topic) => namespace_topic(topic),
            None => dead_letter_topic(),
        };
        DeadLetterWriter::new(Arc::new(TopicDeadLetterPublisher {
            hub: Arc::clone(&self.hub),
            topic,
        }))
    }

    /// Consumer groups currently registered on `topic` (namespace applied).
    pub fn group_count(&self, topic: &str) -> usize {
        self.hub
            .topics()
            .get(&namespace_topic(topic))
            .map_or(0, HashMap::len)
    }
}

impl Default for ChannelQueue {
    fn default() -> Self {
        Self::new(ChannelConfig::default())
    }
}

impl Drop for ChannelQueue {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl MessageQueue for ChannelQueue {
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

        let group = match opts.semantics() {
            DeliverySemantics::AtLeastOnce => {
                let base = match opts.group_id() {
                    "" => topic.as_str(),
                    id => id,
                };
                format!("{}-{}", base, Uuid::new_v4())
            }
            _ => opts.group_id().to_string(),
        };

        let policy = DeliveryPolicy::from_options(&opts, Some(self.dead_letter_writer(&opts)));
        let decoder = opts.decoder.take();
        let receiver = self.hub.join(&topic, &group);
        let membership = Arc::new(Membership {
            hub: Arc::clone(&self.hub),
            topic: topic.clone(),
            group: group.clone(),
            joined: AtomicBool::new(true),
        });
        let cancel = self.shutdown.child_token();

        for worker in 0..opts.concurrency() {
            let handler = Arc::clone(&handler);
            let decoder = decoder.clone();
            let policy = policy.clone();
            let receiver = Arc::clone(&receiver);
            let cancel = cancel.clone();
            let membership = Arc::clone(&membership);
            let topic = topic.clone();

            tokio::spawn(async move {
                loop {
                    let envelope = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        envelope = async { receiver.lock().await.recv().await } => envelope,
                    };
                    let Some(envelope) = envelope else {
                        break;
                    };

                    let outcome = dispatch(
                        handler.as_ref(),
                        decoder.as_ref(),
                        &policy,
                        envelope.id,
                        &topic,
                        &envelope.payload,
                    )
                    .await;
                    if outcome == Outcome::Stop {
                        debug!(topic = %topic, worker, "Subscription stopped by handler");
                        cancel.cancel();
                        membership.leave();
                        break;
                    }
                }
            });
        }

        info!(topic = %topic, group = %group, workers = opts.concurrency(), "Subscribed");
        Ok(Box::new(ChannelSubscription {
            membership,
            cancel,
            done: AtomicBool::new(false),
        }))
    }

    async fn publish(&self, topic: &str, mut opts: PubOptions) -> Result<()> {
        if topic.is_empty() {
            return Err(MqError::EmptyTopic);
        }
        let data = opts.take_data()?;
        let topic = namespace_topic(topic);

        let delay = opts.delay();
        if delay.is_zero() {
            return self.hub.deliver(&topic, data).await;
        }

        let hub = Arc::clone(&self.hub);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    warn!(topic = %topic, "Queue closed, delayed message dropped");
                }
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = hub.deliver(&topic, data).await {
                        warn!(topic = %topic, error = %e, "Delayed publish failed");
                    }
                }
            }
        });
        Ok(())
    }
}

struct ChannelSubscription {
    membership: Arc<Membership>,
    cancel: CancellationToken,
    done: AtomicBool,
}

#[async_trait]
impl Subscription for ChannelSubscription {
    fn topic(&self) -> &str {
        &self.membership.topic
    }

    async fn unsubscribe(&self) -> Result<()> {
        if self.done.swap(true, Ordering::SeqCst) {
            return Err(MqError::InvalidSubscription);
        }
        self.cancel.cancel();
        self.membership.leave();
        debug!(topic = %self.membership.topic, group = %self.membership.group, "Unsubscribed");
        Ok(())
    }
}
