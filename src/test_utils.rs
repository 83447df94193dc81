//! Test utilities.
//!
//! [`RecordingHandler`] answers deliveries from a script of consumption
//! codes and forwards everything it sees to a [`DeliveryLog`] the test can
//! await on.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::bus::MqError;
use crate::message::{ConsumptionCode, Delivery, Message, MessageHandler};

/// How long [`DeliveryLog`] waits for the next delivery.
pub const DELIVERY_WAIT: Duration = Duration::from_secs(2);

/// Handler recording every delivery.
pub struct RecordingHandler {
    deliveries: mpsc::UnboundedSender<Delivery>,
    script: Mutex<VecDeque<ConsumptionCode>>,
    fallback: ConsumptionCode,
}

impl RecordingHandler {
    /// Handler acknowledging everything.
    pub fn acking() -> (Arc<Self>, DeliveryLog) {
        Self::scripted([], ConsumptionCode::Ack)
    }

    /// Handler answering messages with `codes` in order, then `fallback`.
    pub fn scripted(
        codes: impl IntoIterator<Item = ConsumptionCode>,
        fallback: ConsumptionCode,
    ) -> (Arc<Self>, DeliveryLog) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Self {
            deliveries: tx,
            script: Mutex::new(codes.into_iter().collect()),
            fallback,
        });
        (handler, DeliveryLog { rx })
    }
}

impl MessageHandler for RecordingHandler {
    fn handle(&self, delivery: Delivery) -> BoxFuture<'static, ConsumptionCode> {
        let code = match delivery {
            Ok(_) => self
                .script
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
                .unwrap_or(self.fallback),
            Err(_) => self.fallback,
        };
        let _ = self.deliveries.send(delivery);
        Box::pin(async move { code })
    }
}

/// Receiving side of a [`RecordingHandler`].
pub struct DeliveryLog {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl DeliveryLog {
    /// Next delivery, or `None` after [`DELIVERY_WAIT`].
    pub async fn next(&mut self) -> Option<Delivery> {
        tokio::time::timeout(DELIVERY_WAIT, self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next delivery, which must be a message.
    pub async fn next_message(&mut self) -> Arc<Message> {
        match self.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => panic!("expected a message, got error: {}", e),
            None => panic!("no delivery within {:?}", DELIVERY_WAIT),
        }
    }

    /// Next delivery, which must be an error.
    pub async fn next_error(&mut self) -> MqError {
        match self.next().await {
            Some(Err(e)) => e,
            Some(Ok(message)) => panic!("expected an error, got message {}", message.id()),
            None => panic!("no delivery within {:?}", DELIVERY_WAIT),
        }
    }

    /// Assert nothing arrives for `wait`.
    pub async fn assert_quiet(&mut self, wait: Duration) {
        if let Ok(Some(delivery)) = tokio::time::timeout(wait, self.rx.recv()).await {
            panic!("unexpected delivery: {:?}", delivery.map(|m| m.id().to_string()));
        }
    }
}

/// Poll `condition` every 10ms until it holds; panics after [`DELIVERY_WAIT`].
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + DELIVERY_WAIT;
    while !condition().await {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {:?}", DELIVERY_WAIT);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
