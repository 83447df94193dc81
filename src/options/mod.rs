//! Subscribe and publish options.
//!
//! Options are built from composable option functions
//! (`with_at_least_once_delivery()`, `with_bytes(..)`, ...). Each function
//! returns a value that is applied in order by [`SubOptions::build`] /
//! [`PubOptions::build`]; conflicting settings fail the build.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::bus::{MqError, Result};
use crate::codec::{json_value_factory, Decoder, Encoder, JsonDecoder, ValueFactory};

pub const DEFAULT_CONCURRENCY: usize = 1;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// How many consumers receive a given message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DeliverySemantics {
    /// Not chosen; the backend picks its default at subscribe time.
    #[default]
    Unset,
    /// Every subscriber receives every message, possibly more than once.
    AtLeastOnce,
    /// Each message goes to exactly one member of a named group.
    AtMostOnce,
}

impl fmt::Display for DeliverySemantics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unset => f.write_str("unset"),
            Self::AtLeastOnce => f.write_str("at-least-once"),
            Self::AtMostOnce => f.write_str("at-most-once"),
        }
    }
}

/// Resolved subscribe options.
#[derive(Clone)]
pub struct SubOptions {
    pub(crate) semantics: DeliverySemantics,
    pub(crate) group_id: String,
    pub(crate) concurrency: usize,
    pub(crate) max_retries: u32,
    pub(crate) retry_delay: Duration,
    pub(crate) timeout: Duration,
    pub(crate) auto_ack: bool,
    pub(crate) dlq_enabled: bool,
    pub(crate) dlq_topic: Option<String>,
    pub(crate) decoder: Option<(Arc<dyn Decoder>, ValueFactory)>,
}

impl Default for SubOptions {
    fn default() -> Self {
        Self {
            semantics: DeliverySemantics::Unset,
            group_id: String::new(),
            concurrency: DEFAULT_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            timeout: DEFAULT_TIMEOUT,
            auto_ack: true,
            dlq_enabled: false,
            dlq_topic: None,
            decoder: None,
        }
    }
}

impl fmt::Debug for SubOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubOptions")
            .field("semantics", &self.semantics)
            .field("group_id", &self.group_id)
            .field("concurrency", &self.concurrency)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("timeout", &self.timeout)
            .field("auto_ack", &self.auto_ack)
            .field("dlq_enabled", &self.dlq_enabled)
            .field("dlq_topic", &self.dlq_topic)
            .field("decoder", &self.decoder.is_some())
            .finish()
    }
}

impl SubOptions {
    /// Apply option functions over the defaults.
    pub fn build(opts: impl IntoIterator<Item = SubOption>) -> Result<Self> {
        let mut options = Self::default();
        for opt in opts {
            (opt.0)(&mut options)?;
        }
        Ok(options)
    }

    /// Fill in backend defaults, then validate.
    ///
    /// Unset semantics become `default_semantics`; an at-most-once
    /// subscription without a group joins the group named after the topic.
    pub(crate) fn resolve(mut self, default_semantics: DeliverySemantics, topic: &str) -> Result<Self> {
        if self.semantics == DeliverySemantics::Unset {
            self.semantics = default_semantics;
        }
        if self.semantics == DeliverySemantics::AtMostOnce && self.group_id.is_empty() {
            self.group_id = topic.to_string();
        }
        self.validate()?;
        Ok(self)
    }

    /// At-most-once delivery needs a group to share messages within.
    pub fn validate(&self) -> Result<()> {
        if self.semantics == DeliverySemantics::AtMostOnce && self.group_id.is_empty() {
            return Err(MqError::MissingGroupId);
        }
        Ok(())
    }

    pub fn semantics(&self) -> DeliverySemantics {
        self.semantics
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn auto_ack(&self) -> bool {
        self.auto_ack
    }

    pub fn dlq_enabled(&self) -> bool {
        self.dlq_enabled
    }

    pub fn dlq_topic(&self) -> Option<&str> {
        self.dlq_topic.as_deref()
    }

    pub fn decoder(&self) -> Option<&(Arc<dyn Decoder>, ValueFactory)> {
        self.decoder.as_ref()
    }
}

type SubOptionFn = Box<dyn FnOnce(&mut SubOptions) -> Result<()> + Send>;

/// A single subscribe option; see the `with_*` functions.
pub struct SubOption(SubOptionFn);

impl SubOption {
    fn new(f: impl FnOnce(&mut SubOptions) -> Result<()> + Send + 'static) -> Self {
        Self(Box::new(f))
    }
}

/// Every subscriber gets every message.
pub fn with_at_least_once_delivery() -> SubOption {
    SubOption::new(|o| {
        if o.semantics != DeliverySemantics::Unset {
            return Err(MqError::SemanticsAlreadySet);
        }
        o.semantics = DeliverySemantics::AtLeastOnce;
        Ok(())
    })
}

/// Each message goes to one member of `group_id`. An empty id lets the
/// backend pick the group (the topic name).
pub fn with_at_most_once_delivery(group_id: impl Into<String>) -> SubOption {
    let group_id = group_id.into();
    SubOption::new(move |o| {
        if o.semantics != DeliverySemantics::Unset {
            return Err(MqError::SemanticsAlreadySet);
        }
        if !group_id.is_empty() {
            if !o.group_id.is_empty() {
                return Err(MqError::GroupAlreadySet);
            }
            o.group_id = group_id;
        }
        o.semantics = DeliverySemantics::AtMostOnce;
        Ok(())
    })
}

/// Explicit consumer group id.
pub fn with_group(group_id: impl Into<String>) -> SubOption {
    let group_id = group_id.into();
    SubOption::new(move |o| {
        if group_id.is_empty() {
            return Err(MqError::InvalidOption("group id must not be empty".to_string()));
        }
        if !o.group_id.is_empty() {
            return Err(MqError::GroupAlreadySet);
        }
        o.group_id = group_id;
        Ok(())
    })
}

pub fn with_concurrency(concurrency: usize) -> SubOption {
    SubOption::new(move |o| {
        if concurrency == 0 {
            return Err(MqError::InvalidOption(
                "concurrency must be greater than zero".to_string(),
            ));
        }
        o.concurrency = concurrency;
        Ok(())
    })
}

pub fn with_max_retries(max_retries: u32) -> SubOption {
    SubOption::new(move |o| {
        o.max_retries = max_retries;
        Ok(())
    })
}

pub fn with_retry_delay(delay: Duration) -> SubOption {
    SubOption::new(move |o| {
        o.retry_delay = delay;
        Ok(())
    })
}

/// Upper bound on one handler invocation.
pub fn with_timeout(timeout: Duration) -> SubOption {
    SubOption::new(move |o| {
        o.timeout = timeout;
        Ok(())
    })
}

pub fn with_auto_ack(auto_ack: bool) -> SubOption {
    SubOption::new(move |o| {
        o.auto_ack = auto_ack;
        Ok(())
    })
}

pub fn with_dlq_enabled(enabled: bool) -> SubOption {
    SubOption::new(move |o| {
        o.dlq_enabled = enabled;
        Ok(())
    })
}

pub fn with_dlq_topic(topic: impl Into<String>) -> SubOption {
    let topic = topic.into();
    SubOption::new(move |o| {
        if topic.is_empty() {
            return Err(MqError::InvalidOption(
                "dead-letter topic must not be empty".to_string(),
            ));
        }
        o.dlq_topic = Some(topic);
        Ok(())
    })
}

/// Decode payloads before delivery.
pub fn with_decoder(decoder: Arc<dyn Decoder>, factory: ValueFactory) -> SubOption {
    SubOption::new(move |o| {
        o.decoder = Some((decoder, factory));
        Ok(())
    })
}

/// Decode JSON payloads into `T`; read them back with `Message::value::<T>()`.
pub fn with_json_decoder<T>() -> SubOption
where
    T: serde::de::DeserializeOwned + Send + Sync + 'static,
{
    with_decoder(Arc::new(JsonDecoder::<T>::new()), json_value_factory::<T>())
}

/// Resolved publish options.
#[derive(Debug, Clone, Default)]
pub struct PubOptions {
    pub(crate) data: Option<Vec<u8>>,
    pub(crate) delay: Duration,
}

impl PubOptions {
    pub fn build(opts: impl IntoIterator<Item = PubOption>) -> Result<Self> {
        let mut options = Self::default();
        for opt in opts {
            (opt.0)(&mut options)?;
        }
        Ok(options)
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Take the payload out, failing when none was set.
    pub(crate) fn take_data(&mut self) -> Result<Vec<u8>> {
        self.data.take().ok_or(MqError::MissingData)
    }

    fn set_data(&mut self, data: Vec<u8>) -> Result<()> {
        if self.data.is_some() {
            return Err(MqError::DataAlreadySet);
        }
        self.data = Some(data);
        Ok(())
    }
}

type PubOptionFn = Box<dyn FnOnce(&mut PubOptions) -> Result<()> + Send>;

/// A single publish option; see the `with_*` functions below.
pub struct PubOption(PubOptionFn);

impl PubOption {
    fn new(f: impl FnOnce(&mut PubOptions) -> Result<()> + Send + 'static) -> Self {
        Self(Box::new(f))
    }
}

pub fn with_bytes(data: impl Into<Vec<u8>>) -> PubOption {
    let data = data.into();
    PubOption::new(move |o| o.set_data(data))
}

/// Serialize `value` as the JSON payload.
pub fn with_json<T: Serialize + ?Sized>(value: &T) -> PubOption {
    let encoded = serde_json::to_vec(value);
    PubOption::new(move |o| {
        let data = encoded.map_err(|e| MqError::Codec(e.into()))?;
        o.set_data(data)
    })
}

/// Encode `value` for `topic` with a caller-supplied encoder.
pub fn with_encoder<T, E>(encoder: &E, topic: &str, value: &T) -> PubOption
where
    T: ?Sized,
    E: Encoder<T> + ?Sized,
{
    let encoded = encoder.encode(topic, value);
    PubOption::new(move |o| o.set_data(encoded?))
}

/// Ask the backend to hold the message back; not every backend supports it.
pub fn with_delay(delay: Duration) -> PubOption {
    PubOption::new(move |o| {
        o.delay = delay;
        Ok(())
    })
}
