//! Delivered messages and the handler contract.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::bus::MqError;
use crate::codec::{CodecError, Decoder, ValueFactory};

/// A handler's verdict on one delivered message.
///
/// This is the only feedback channel from application code back to the
/// consuming side of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumptionCode {
    /// Processed; move on to the next message.
    Ack,
    /// Processed; stop consuming on this subscription.
    AckFinal,
    /// Failed, but may succeed if delivered again.
    NackTransientFailure,
    /// Failed for good; skip it and salvage the payload to the dead letter.
    NackPersistentFailure,
}

impl TryFrom<i32> for ConsumptionCode {
    type Error = MqError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Ack),
            1 => Ok(Self::AckFinal),
            2 => Ok(Self::NackTransientFailure),
            3 => Ok(Self::NackPersistentFailure),
            other => Err(MqError::UnsupportedConsumptionCode(other)),
        }
    }
}

/// Message body: the raw payload, or the value a decoder produced from it.
pub enum Body {
    Raw(Vec<u8>),
    Decoded(Box<dyn Any + Send + Sync>),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Raw(data) => f.debug_tuple("Raw").field(&data.len()).finish(),
            Body::Decoded(_) => f.write_str("Decoded(..)"),
        }
    }
}

/// A message delivered to a subscription handler.
#[derive(Debug)]
pub struct Message {
    id: String,
    topic: String,
    body: Body,
}

impl Message {
    /// Message carrying the raw payload.
    pub fn raw(id: impl Into<String>, topic: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
            body: Body::Raw(data),
        }
    }

    /// Build a message, running the optional decoder over the payload.
    ///
    /// Without a decoder the payload is kept as-is; with one, only the
    /// decoded value is kept.
    pub fn decode(
        id: impl Into<String>,
        topic: &str,
        data: &[u8],
        decoder: Option<&(Arc<dyn Decoder>, ValueFactory)>,
    ) -> Result<Self, CodecError> {
        let body = match decoder {
            None => Body::Raw(data.to_vec()),
            Some((decoder, factory)) => {
                let mut value = factory();
                decoder.decode(topic, data, value.as_mut())?;
                Body::Decoded(value)
            }
        };
        Ok(Self {
            id: id.into(),
            topic: topic.to_string(),
            body,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Raw payload, when no decoder was attached.
    pub fn data(&self) -> Option<&[u8]> {
        match &self.body {
            Body::Raw(data) => Some(data),
            Body::Decoded(_) => None,
        }
    }

    /// Decoded value, when a decoder was attached.
    ///
    /// Accepts both plain `T` slots and the `Option<T>` slots produced by
    /// [`crate::codec::json_value_factory`].
    pub fn value<T: 'static>(&self) -> Option<&T> {
        match &self.body {
            Body::Raw(_) => None,
            Body::Decoded(value) => value
                .downcast_ref::<T>()
                .or_else(|| value.downcast_ref::<Option<T>>().and_then(Option::as_ref)),
        }
    }
}

/// What a handler receives: a message, or a mid-stream failure.
pub type Delivery = Result<Arc<Message>, MqError>;

/// Subscription callback.
///
/// For `Err` deliveries the returned code is ignored.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, delivery: Delivery) -> BoxFuture<'static, ConsumptionCode>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap a closure `Fn(Delivery) -> impl Future<Output = ConsumptionCode>`.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = ConsumptionCode> + Send + 'static,
{
    FnHandler { f }
}

impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = ConsumptionCode> + Send + 'static,
{
    fn handle(&self, delivery: Delivery) -> BoxFuture<'static, ConsumptionCode> {
        Box::pin((self.f)(delivery))
    }
}

impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    fn handle(&self, delivery: Delivery) -> BoxFuture<'static, ConsumptionCode> {
        (**self).handle(delivery)
    }
}
