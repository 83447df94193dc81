//! Delivery policy shared by the in-process and NATS backends.
//!
//! These backends honour the subscription's retry options, unlike the
//! Kafka readers whose state machine is fixed:
//!
//! - auto-ack: the handler runs once, bounded by the timeout. Only
//!   `AckFinal` has an effect (the worker stops).
//! - manual ack: `NackTransientFailure` or a timeout retries after the
//!   retry delay, up to `max_retries` times, then dead-letters.
//!   `NackPersistentFailure` dead-letters at once.
//!
//! Dead-lettering only happens when the subscription enabled it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::MqError;
use crate::codec::{Decoder, ValueFactory};
use crate::dlq::DeadLetterWriter;
use crate::message::{ConsumptionCode, Message, MessageHandler};
use crate::options::SubOptions;

/// Whether a worker keeps consuming after a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Continue,
    Stop,
}

/// Retry and dead-letter settings of one subscription.
#[derive(Clone)]
pub(crate) struct DeliveryPolicy {
    pub auto_ack: bool,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
    pub dead_letter: Option<DeadLetterWriter>,
}

impl DeliveryPolicy {
    pub(crate) fn from_options(opts: &SubOptions, dead_letter: Option<DeadLetterWriter>) -> Self {
        Self {
            auto_ack: opts.auto_ack(),
            max_retries: opts.max_retries(),
            retry_delay: opts.retry_delay(),
            timeout: opts.timeout(),
            dead_letter: if opts.dlq_enabled() { dead_letter } else { None },
        }
    }

    fn dead_letter(&self, topic: &str, payload: &[u8]) {
        match self.dead_letter {
            Some(ref writer) => writer.write(payload.to_vec()),
            None => debug!(topic = %topic, "Dead letter disabled, message dropped"),
        }
    }
}

/// Decode `payload` and run it through the handler under `policy`.
///
/// A payload the decoder rejects is reported to the handler and
/// dead-lettered.
pub(crate) async fn dispatch(
    handler: &dyn MessageHandler,
    decoder: Option<&(Arc<dyn Decoder>, ValueFactory)>,
    policy: &DeliveryPolicy,
    id: String,
    topic: &str,
    payload: &[u8],
) -> Outcome {
    let message = match Message::decode(id, topic, payload, decoder) {
        Ok(message) => Arc::new(message),
        Err(e) => {
            warn!(topic = %topic, error = %e, "Decode failed");
            handler.handle(Err(MqError::Codec(e))).await;
            policy.dead_letter(topic, payload);
            return Outcome::Continue;
        }
    };

    if policy.auto_ack {
        return match tokio::time::timeout(policy.timeout, handler.handle(Ok(message))).await {
            Ok(ConsumptionCode::AckFinal) => Outcome::Stop,
            Ok(_) => Outcome::Continue,
            Err(_) => {
                warn!(topic = %topic, timeout = ?policy.timeout, "Handler timed out");
                Outcome::Continue
            }
        };
    }

    let mut attempt = 0;
    loop {
        let verdict =
            tokio::time::timeout(policy.timeout, handler.handle(Ok(Arc::clone(&message)))).await;

        match verdict {
            Ok(ConsumptionCode::Ack) => return Outcome::Continue,
            Ok(ConsumptionCode::AckFinal) => return Outcome::Stop,
            Ok(ConsumptionCode::NackPersistentFailure) => {
                policy.dead_letter(topic, payload);
                return Outcome::Continue;
            }
            Ok(ConsumptionCode::NackTransientFailure) | Err(_) => {
                if attempt >= policy.max_retries {
                    warn!(topic = %topic, id = %message.id(), attempts = attempt + 1, "Retries exhausted");
                    policy.dead_letter(topic, payload);
                    return Outcome::Continue;
                }
                attempt += 1;
                debug!(topic = %topic, id = %message.id(), attempt, "Retrying delivery");
                tokio::time::sleep(policy.retry_delay).await;
            }
        }
    }
}
