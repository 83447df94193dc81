//! Bounded reader pool for one topic under one delivery regime.
//!
//! The free list is a bounded channel sized to the group's capacity. It is
//! both the limiter (at most `capacity` readers ever exist) and the
//! recycler (a torn-down reader sends itself back in).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::client::LogBroker;
use super::reader::Reader;
use super::stats::{spawn_stats_logger, StatsProvider};
use crate::bus::{MqError, Result, Subscription};
use crate::codec::{Decoder, ValueFactory};
use crate::dlq::DeadLetterWriter;
use crate::message::MessageHandler;

/// How readers of a group pick their broker consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum GroupIds {
    /// Each reader gets `{base}-{uuid}`, so every reader sees every message.
    PerReader(String),
    /// All readers join the one consumer group and share the partitions.
    Shared(String),
}

impl GroupIds {
    fn next(&self) -> String {
        match self {
            GroupIds::PerReader(base) => format!("{}-{}", base, Uuid::new_v4()),
            GroupIds::Shared(id) => id.clone(),
        }
    }
}

/// Settings shared by every group of one queue.
#[derive(Clone)]
pub(crate) struct ReaderGroupContext {
    pub broker: Arc<dyn LogBroker>,
    pub dead_letter: DeadLetterWriter,
    pub acquire_timeout: Duration,
    pub stats_period: Duration,
    pub shutdown: CancellationToken,
}

pub(crate) struct ReaderGroup {
    topic: String,
    group_ids: GroupIds,
    capacity: usize,
    context: ReaderGroupContext,
    free_tx: mpsc::Sender<Arc<Reader>>,
    free_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<Reader>>>,
    created: AtomicUsize,
}

impl ReaderGroup {
    pub(crate) fn new(
        topic: impl Into<String>,
        group_ids: GroupIds,
        capacity: usize,
        context: ReaderGroupContext,
    ) -> Self {
        let capacity = capacity.max(1);
        let (free_tx, free_rx) = mpsc::channel(capacity);
        Self {
            topic: topic.into(),
            group_ids,
            capacity,
            context,
            free_tx,
            free_rx: tokio::sync::Mutex::new(free_rx),
            created: AtomicUsize::new(0),
        }
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Readers created so far.
    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Readers sitting in the free list.
    pub(crate) fn idle(&self) -> usize {
        self.free_tx.max_capacity() - self.free_tx.capacity()
    }

    /// Lend a reader to `handler`.
    ///
    /// Takes an idle reader when one is free, creates one while below
    /// capacity, and otherwise waits for a reader to come back until the
    /// acquire timeout elapses.
    ///
    /// Growth is tried before the wait on purpose, not after it: a pool
    /// below capacity never pays the acquire timeout. The capacity bound
    /// and the exhaustion error are the same either way.
    pub(crate) async fn subscribe(
        &self,
        handler: Arc<dyn MessageHandler>,
        decoder: Option<(Arc<dyn Decoder>, ValueFactory)>,
    ) -> Result<Box<dyn Subscription>> {
        let reader = match self.try_acquire().await {
            Some(reader) => reader,
            None => match self.grow()? {
                Some(reader) => reader,
                None => self.acquire().await.ok_or_else(|| {
                    debug!(
                        topic = %self.topic,
                        capacity = self.capacity,
                        created = self.created(),
                        idle = self.idle(),
                        "Reader pool exhausted"
                    );
                    MqError::NoReadersAvailable {
                        topic: self.topic.clone(),
                    }
                })?,
            },
        };

        let run = reader.start(handler, decoder);
        Ok(Box::new(ReaderSubscription::new(
            self.topic.clone(),
            reader,
            run,
        )))
    }

    async fn try_acquire(&self) -> Option<Arc<Reader>> {
        self.free_rx.lock().await.try_recv().ok()
    }

    async fn acquire(&self) -> Option<Arc<Reader>> {
        let wait = async { self.free_rx.lock().await.recv().await };
        tokio::time::timeout(self.context.acquire_timeout, wait)
            .await
            .ok()
            .flatten()
    }

    fn grow(&self) -> Result<Option<Arc<Reader>>> {
        let capacity = self.capacity;
        let Ok(previous) = self
            .created
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < capacity).then_some(n + 1)
            })
        else {
            return Ok(None);
        };

        let group_id = self.group_ids.next();
        let consumer = match self.context.broker.consumer(&self.topic, &group_id) {
            Ok(consumer) => consumer,
            Err(e) => {
                self.created.fetch_sub(1, Ordering::SeqCst);
                return Err(MqError::Broker(e));
            }
        };

        let reader = Arc::new(Reader::new(
            previous,
            self.topic.clone(),
            group_id,
            consumer,
            self.free_tx.downgrade(),
            self.context.dead_letter.clone(),
            self.context.shutdown.clone(),
        ));

        let provider: Weak<dyn StatsProvider> = Arc::downgrade(&reader) as Weak<dyn StatsProvider>;
        spawn_stats_logger(
            provider,
            self.context.stats_period,
            self.context.shutdown.clone(),
        );

        info!(
            topic = %self.topic,
            reader = reader.id(),
            group_id = %reader.group_id(),
            "Reader created"
        );
        Ok(Some(reader))
    }
}

/// Subscription backed by one pooled reader.
pub(crate) struct ReaderSubscription {
    topic: String,
    claim: Mutex<Option<(Arc<Reader>, u64)>>,
}

impl ReaderSubscription {
    fn new(topic: String, reader: Arc<Reader>, run: u64) -> Self {
        Self {
            topic,
            claim: Mutex::new(Some((reader, run))),
        }
    }
}

#[async_trait]
impl Subscription for ReaderSubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn unsubscribe(&self) -> Result<()> {
        let claim = self
            .claim
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let (reader, run) = claim.ok_or(MqError::InvalidSubscription)?;

        if !reader.return_to_pool(run) {
            debug!(topic = %self.topic, reader = reader.id(), "Reader already stopped");
        }
        Ok(())
    }
}
