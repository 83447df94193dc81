//! mqroute-tail: print every message of one topic.
//!
//! ## Configuration
//! - MQROUTE_TOPIC: Topic to follow, `scheme://name` (required)
//! - MQROUTE_GROUP: At-most-once group to join (optional; without it the
//!   tail sees every message, at-least-once)
//! - MQROUTE_CONFIG / mqroute.yaml / MQROUTE__*: backend configuration
//! - MQROUTE_LOG: log filter (default: info)

use tracing::{info, warn};

use mqroute::bus::init_router;
use mqroute::config::Config;
use mqroute::options::{with_at_least_once_delivery, with_at_most_once_delivery};
use mqroute::utils::bootstrap::init_tracing;
use mqroute::{handler_fn, ConsumptionCode, Delivery};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let topic = std::env::var("MQROUTE_TOPIC").map_err(|_| "MQROUTE_TOPIC is not set")?;
    let semantics = match std::env::var("MQROUTE_GROUP") {
        Ok(group) => with_at_most_once_delivery(group),
        Err(_) => with_at_least_once_delivery(),
    };

    let config = Config::load(None)?;
    let router = init_router(&config).await?;

    let handler = handler_fn(|delivery: Delivery| async move {
        match delivery {
            Ok(message) => match message.data() {
                Some(data) => println!(
                    "[{}] {} {}",
                    message.topic(),
                    message.id(),
                    String::from_utf8_lossy(data)
                ),
                None => println!("[{}] {} <decoded>", message.topic(), message.id()),
            },
            Err(e) => warn!(error = %e, "Delivery failed"),
        }
        ConsumptionCode::Ack
    });

    let subscription = router.subscribe(&topic, handler, [semantics]).await?;
    info!(topic = %topic, "mqroute-tail started");

    tokio::signal::ctrl_c().await?;
    subscription.unsubscribe().await?;
    info!("mqroute-tail stopped");

    Ok(())
}
