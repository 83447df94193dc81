//! Scheme-based dispatch to backends.
//!
//! Topics are addressed as `scheme://name`. The router splits off the
//! scheme, looks up the backend bound to it and hands over the bare name.
//! It never buffers or retries.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::debug;

use crate::bus::{MessageQueue, MqError, Result, Subscription};
use crate::message::MessageHandler;
use crate::options::{PubOption, PubOptions, SubOption, SubOptions};

/// Separator between scheme and topic name.
pub const SCHEME_SEPARATOR: &str = "://";

/// Backend families a topic can be addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Partition-based log broker.
    Kafka,
    /// Lightweight pub/sub broker.
    Nats,
    /// Simple topic broker.
    Nsq,
    /// In-process broker.
    Memory,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Kafka => "kafka",
            Scheme::Nats => "nats",
            Scheme::Nsq => "nsq",
            Scheme::Memory => "mem",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = MqError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "kafka" => Ok(Scheme::Kafka),
            "nats" => Ok(Scheme::Nats),
            "nsq" => Ok(Scheme::Nsq),
            "mem" => Ok(Scheme::Memory),
            other => Err(MqError::UnsupportedScheme(other.to_string())),
        }
    }
}

/// Split `scheme://name` into its scheme and name.
pub fn parse_topic(topic: &str) -> Result<(Scheme, &str)> {
    let (scheme, name) = topic
        .split_once(SCHEME_SEPARATOR)
        .ok_or_else(|| MqError::TopicParse(topic.to_string()))?;
    if scheme.is_empty() || name.is_empty() {
        return Err(MqError::TopicParse(topic.to_string()));
    }
    Ok((scheme.parse()?, name))
}

/// Publish/subscribe facade over the bound backends.
#[derive(Default, Clone)]
pub struct Router {
    queues: HashMap<Scheme, Arc<dyn MessageQueue>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `queue` to `scheme`, replacing any previous binding.
    pub fn bind(&mut self, scheme: Scheme, queue: Arc<dyn MessageQueue>) {
        self.queues.insert(scheme, queue);
    }

    /// Builder-style [`Router::bind`].
    pub fn with_queue(mut self, scheme: Scheme, queue: Arc<dyn MessageQueue>) -> Self {
        self.bind(scheme, queue);
        self
    }

    /// Whether a backend is bound to `scheme`.
    pub fn is_bound(&self, scheme: Scheme) -> bool {
        self.queues.contains_key(&scheme)
    }

    fn route<'a>(&self, topic: &'a str) -> Result<(&Arc<dyn MessageQueue>, &'a str)> {
        let (scheme, name) = parse_topic(topic)?;
        let queue = self
            .queues
            .get(&scheme)
            .ok_or(MqError::NoQueueConfigured(scheme))?;
        debug!(scheme = %scheme, topic = %name, "Routing");
        Ok((queue, name))
    }

    /// Subscribe `handler` to `topic` (`scheme://name`).
    pub async fn subscribe<H>(
        &self,
        topic: &str,
        handler: H,
        opts: impl IntoIterator<Item = SubOption>,
    ) -> Result<Box<dyn Subscription>>
    where
        H: MessageHandler + 'static,
    {
        let (queue, name) = self.route(topic)?;
        let opts = SubOptions::build(opts)?;
        queue.subscribe(name, Arc::new(handler), opts).await
    }

    /// Publish to `topic` (`scheme://name`).
    pub async fn publish(&self, topic: &str, opts: impl IntoIterator<Item = PubOption>) -> Result<()> {
        let (queue, name) = self.route(topic)?;
        let opts = PubOptions::build(opts)?;
        queue.publish(name, opts).await
    }
}

#[cfg(test)]
mod tests;
