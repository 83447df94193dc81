//! Pooled consumer and its receive loop.
//!
//! A [`Reader`] owns one broker consumer for the lifetime of the queue and
//! is lent to one subscription at a time:
//!
//! ```text
//! Idle ──start──▶ Fetching ──record──▶ Delivering ──┬─▶ Fetching
//!  ▲                                                 │
//!  └──────────────── teardown ◀──────────────────────┘
//! ```
//!
//! Leaving the loop always goes through teardown, which clears the
//! subscription's handler and decoder and pushes the reader back onto its
//! group's free list.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use backon::Retryable;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::client::{BrokerError, LogConsumer, Record};
use super::stats::{Counter, StatsProvider};
use crate::bus::{MqError, Result};
use crate::codec::{Decoder, ValueFactory};
use crate::dlq::DeadLetterWriter;
use crate::message::{ConsumptionCode, Message, MessageHandler};
use crate::utils::retry::commit_backoff;

type DecoderPair = (Arc<dyn Decoder>, ValueFactory);

/// Per-subscription fields, touched by both the loop and `return_to_pool`.
#[derive(Default)]
struct ReaderState {
    handler: Option<Arc<dyn MessageHandler>>,
    decoder: Option<DecoderPair>,
    cancel: Option<CancellationToken>,
    returning: bool,
    /// Incremented per `start`; lets a stale subscription handle detect
    /// that the reader has moved on.
    run: u64,
}

#[derive(Default)]
struct ReaderStats {
    fetched: Counter,
    delivered: Counter,
    redelivered: Counter,
    committed: Counter,
    commit_failures: Counter,
    dead_lettered: Counter,
    fetch_failures: Counter,
}

/// What the loop does after a message has been dealt with.
#[derive(Debug, PartialEq, Eq)]
enum Next {
    Fetch,
    Stop,
}

pub(crate) struct Reader {
    id: usize,
    topic: String,
    group_id: String,
    consumer: Arc<dyn LogConsumer>,
    free_list: mpsc::WeakSender<Arc<Reader>>,
    dead_letter: DeadLetterWriter,
    shutdown: CancellationToken,
    state: Mutex<ReaderState>,
    stats: ReaderStats,
}

impl Reader {
    pub(crate) fn new(
        id: usize,
        topic: impl Into<String>,
        group_id: impl Into<String>,
        consumer: Arc<dyn LogConsumer>,
        free_list: mpsc::WeakSender<Arc<Reader>>,
        dead_letter: DeadLetterWriter,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            topic: topic.into(),
            group_id: group_id.into(),
            consumer,
            free_list,
            dead_letter,
            shutdown,
            state: Mutex::new(ReaderState::default()),
            stats: ReaderStats::default(),
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn group_id(&self) -> &str {
        &self.group_id
    }

    fn state(&self) -> MutexGuard<'_, ReaderState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_returning(&self) -> bool {
        self.state().returning
    }

    /// Claim the reader for a subscription and start its loop.
    ///
    /// Returns the run id the subscription must present to
    /// [`Reader::return_to_pool`].
    pub(crate) fn start(
        self: &Arc<Self>,
        handler: Arc<dyn MessageHandler>,
        decoder: Option<DecoderPair>,
    ) -> u64 {
        let cancel = self.shutdown.child_token();
        let run = {
            let mut state = self.state();
            state.run += 1;
            state.handler = Some(handler);
            state.decoder = decoder;
            state.cancel = Some(cancel.clone());
            state.returning = false;
            state.run
        };

        debug!(topic = %self.topic, reader = self.id, run, "Reader started");
        tokio::spawn(Arc::clone(self).receive_loop(cancel));
        run
    }

    /// Ask the loop of `run` to stop and hand the reader back.
    ///
    /// Returns false when that run already ended on its own.
    pub(crate) fn return_to_pool(&self, run: u64) -> bool {
        let mut state = self.state();
        if state.run != run || state.returning {
            return false;
        }
        let Some(cancel) = state.cancel.clone() else {
            return false;
        };
        state.returning = true;
        cancel.cancel();
        true
    }

    async fn receive_loop(self: Arc<Self>, cancel: CancellationToken) {
        let (handler, decoder) = {
            let state = self.state();
            (state.handler.clone(), state.decoder.clone())
        };

        if let Some(handler) = handler {
            loop {
                if self.is_returning() {
                    break;
                }

                let fetched = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    fetched = self.consumer.fetch() => fetched,
                };

                let record = match fetched {
                    Ok(record) => record,
                    Err(e) => {
                        self.stats.fetch_failures.incr();
                        warn!(topic = %self.topic, reader = self.id, error = %e, "Fetch failed");
                        handler.handle(Err(MqError::Fetch(e))).await;
                        break;
                    }
                };
                self.stats.fetched.incr();

                let next = match Message::decode(
                    record.id(),
                    &self.topic,
                    &record.payload,
                    decoder.as_ref(),
                ) {
                    Ok(message) => self.deliver(handler.as_ref(), Arc::new(message), &record).await,
                    Err(e) => {
                        warn!(topic = %self.topic, offset = record.offset, error = %e, "Decode failed");
                        handler.handle(Err(MqError::Codec(e))).await;
                        self.skip(handler.as_ref(), &record).await
                    }
                };

                if next == Next::Stop || self.is_returning() {
                    break;
                }
            }
        }

        self.teardown();
    }

    /// Hand `message` to the handler until it settles on a verdict.
    async fn deliver(
        &self,
        handler: &dyn MessageHandler,
        message: Arc<Message>,
        record: &Record,
    ) -> Next {
        loop {
            let code = handler.handle(Ok(Arc::clone(&message))).await;
            self.stats.delivered.incr();

            match code {
                ConsumptionCode::Ack => {
                    return match self.commit(record).await {
                        Ok(()) => Next::Fetch,
                        Err(e) => {
                            handler.handle(Err(e)).await;
                            Next::Stop
                        }
                    };
                }
                ConsumptionCode::AckFinal => {
                    if let Err(e) = self.commit(record).await {
                        handler.handle(Err(e)).await;
                    }
                    return Next::Stop;
                }
                ConsumptionCode::NackTransientFailure => {
                    if self.is_returning() {
                        return Next::Stop;
                    }
                    self.stats.redelivered.incr();
                    debug!(topic = %self.topic, offset = record.offset, "Redelivering");
                    // a handler that resolves immediately must not starve unsubscribe
                    tokio::task::yield_now().await;
                }
                ConsumptionCode::NackPersistentFailure => {
                    return self.skip(handler, record).await;
                }
            }
        }
    }

    /// Commit past `record` and salvage its payload to the dead letter.
    async fn skip(&self, handler: &dyn MessageHandler, record: &Record) -> Next {
        let committed = self.commit(record).await;

        self.stats.dead_lettered.incr();
        self.dead_letter.write(record.payload.clone());

        match committed {
            Ok(()) => Next::Fetch,
            Err(e) => {
                handler.handle(Err(e)).await;
                Next::Stop
            }
        }
    }

    async fn commit(&self, record: &Record) -> Result<()> {
        let consumer = &self.consumer;
        let result = (|| async move { consumer.commit(record).await })
            .retry(commit_backoff())
            .notify(|err: &BrokerError, _: Duration| {
                debug!(topic = %self.topic, offset = record.offset, error = %err, "Commit failed, retrying");
            })
            .await;

        match result {
            Ok(()) => {
                self.stats.committed.incr();
                Ok(())
            }
            Err(e) => {
                self.stats.commit_failures.incr();
                warn!(topic = %self.topic, offset = record.offset, error = %e, "Commit failed");
                Err(MqError::Commit(e))
            }
        }
    }

    fn teardown(self: Arc<Self>) {
        {
            let mut state = self.state();
            state.handler = None;
            state.decoder = None;
            state.cancel = None;
            state.returning = false;
        }

        let Some(free_list) = self.free_list.upgrade() else {
            debug!(topic = %self.topic, reader = self.id, "Reader group gone, reader retired");
            return;
        };
        let id = self.id;
        let topic = self.topic.clone();
        match free_list.try_send(self) {
            Ok(()) => debug!(topic = %topic, reader = id, "Reader returned to pool"),
            Err(e) => warn!(topic = %topic, reader = id, error = %e, "Cannot return reader to pool"),
        }
    }
}

impl StatsProvider for Reader {
    fn stats_kind(&self) -> &'static str {
        "reader"
    }

    fn stats_topic(&self) -> &str {
        &self.topic
    }

    fn stats_snapshot(&self) -> Vec<(&'static str, u64)> {
        let stats = &self.stats;
        vec![
            ("fetched", stats.fetched.get()),
            ("delivered", stats.delivered.get()),
            ("redelivered", stats.redelivered.get()),
            ("committed", stats.committed.get()),
            ("commit_failures", stats.commit_failures.get()),
            ("dead_lettered", stats.dead_lettered.get()),
            ("fetch_failures", stats.fetch_failures.get()),
        ]
    }
}
