//! mqroute - multi-backend message queue facade.
//!
//! A single publish/subscribe API that routes each call to a broker backend
//! chosen by the topic's scheme prefix (`kafka://orders`, `mem://jobs`, ...),
//! with at-least-once / at-most-once delivery semantics on top.

pub mod bus;
pub mod codec;
pub mod config;
pub mod dlq;
pub mod message;
pub mod namespace;
pub mod options;
pub mod router;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod utils;

pub use bus::{MessageQueue, MqError, Result, Subscription};
pub use message::{handler_fn, ConsumptionCode, Delivery, Message, MessageHandler};
pub use namespace::{namespace_topic, set_namespace};
pub use options::{DeliverySemantics, PubOption, PubOptions, SubOption, SubOptions};
pub use router::{Router, Scheme};
