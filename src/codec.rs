//! Optional payload encoding/decoding.
//!
//! Publishers may hand a value plus an [`Encoder`] instead of raw bytes;
//! subscribers may attach a [`Decoder`] together with a [`ValueFactory`] so
//! handlers receive a typed value instead of the raw payload.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Errors raised while encoding or decoding payloads.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Decode target has unexpected type (topic {topic})")]
    TargetType { topic: String },

    #[error("Codec error: {0}")]
    Other(String),
}

/// Produces the empty value a [`Decoder`] fills in.
pub type ValueFactory = Arc<dyn Fn() -> Box<dyn Any + Send + Sync> + Send + Sync>;

/// Turns a value into a payload for a topic.
pub trait Encoder<T: ?Sized>: Send + Sync {
    fn encode(&self, topic: &str, value: &T) -> Result<Vec<u8>, CodecError>;
}

/// Fills a value produced by a [`ValueFactory`] from a raw payload.
pub trait Decoder: Send + Sync {
    fn decode(
        &self,
        topic: &str,
        data: &[u8],
        target: &mut (dyn Any + Send + Sync),
    ) -> Result<(), CodecError>;
}

/// JSON encoder for any `Serialize` value.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonEncoder;

impl<T: Serialize + ?Sized> Encoder<T> for JsonEncoder {
    fn encode(&self, _topic: &str, value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(value)?)
    }
}

/// JSON decoder filling an `Option<T>` slot.
///
/// Pair it with [`json_value_factory`]; handlers then read the value with
/// `Message::value::<T>()`.
pub struct JsonDecoder<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonDecoder<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Decoder for JsonDecoder<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn decode(
        &self,
        topic: &str,
        data: &[u8],
        target: &mut (dyn Any + Send + Sync),
    ) -> Result<(), CodecError> {
        let slot = target
            .downcast_mut::<Option<T>>()
            .ok_or_else(|| CodecError::TargetType {
                topic: topic.to_string(),
            })?;
        *slot = Some(serde_json::from_slice(data)?);
        Ok(())
    }
}

/// Value factory producing the empty `Option<T>` slot [`JsonDecoder`] fills.
pub fn json_value_factory<T: Send + Sync + 'static>() -> ValueFactory {
    Arc::new(|| Box::new(None::<T>) as Box<dyn Any + Send + Sync>)
}
