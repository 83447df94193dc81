//! Process-wide topic namespace.
//!
//! The namespace is global state, so every test here is serialized and
//! resets it when done.

use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;
use tokio::sync::mpsc;

use mqroute::bus::{init_router, KafkaQueue, MockLogBroker};
use mqroute::config::{Config, KafkaConfig};
use mqroute::namespace::namespace;
use mqroute::options::with_bytes;
use mqroute::{handler_fn, namespace_topic, set_namespace, ConsumptionCode, Router, Scheme};

struct ResetNamespace;

impl Drop for ResetNamespace {
    fn drop(&mut self) {
        set_namespace("");
    }
}

#[test]
#[serial]
fn test_namespace_prefixes_topics() {
    let _reset = ResetNamespace;
    assert_eq!(namespace_topic("orders"), "orders");

    set_namespace("staging");
    assert_eq!(namespace(), "staging");
    assert_eq!(namespace_topic("orders"), "staging.orders");

    set_namespace("");
    assert_eq!(namespace_topic("orders"), "orders");
}

#[tokio::test]
#[serial]
async fn test_kafka_topics_created_inside_namespace() {
    let _reset = ResetNamespace;
    set_namespace("tenant");

    let broker = MockLogBroker::new();
    let queue = KafkaQueue::new(KafkaConfig::default(), Arc::new(broker.clone()))
        .await
        .unwrap();
    let router = Router::new().with_queue(Scheme::Kafka, Arc::new(queue));

    router
        .publish("kafka://orders", [with_bytes("x")])
        .await
        .unwrap();

    let topics = broker.created_topics();
    assert!(topics.contains(&"tenant.dead-letter".to_string()));
    assert!(topics.contains(&"tenant.orders".to_string()));
    assert_eq!(broker.messages("tenant.orders"), vec![b"x".to_vec()]);
    assert!(broker.messages("orders").is_empty());
}

#[tokio::test]
#[serial]
async fn test_init_router_applies_configured_namespace() {
    let _reset = ResetNamespace;
    let config = Config {
        namespace: Some("qa".to_string()),
        ..Config::in_process()
    };
    let router = init_router(&config).await.unwrap();
    assert_eq!(namespace(), "qa");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |delivery: mqroute::Delivery| {
        let tx = tx.clone();
        async move {
            if let Ok(message) = delivery {
                let _ = tx.send(message.topic().to_string());
            }
            ConsumptionCode::Ack
        }
    });
    let _subscription = router.subscribe("mem://jobs", handler, []).await.unwrap();
    router.publish("mem://jobs", [with_bytes("x")]).await.unwrap();

    let topic = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(topic, "qa.jobs");
}
