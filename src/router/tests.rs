use super::*;
use crate::bus::ChannelQueue;
use crate::config::ChannelConfig;
use crate::message::{handler_fn, ConsumptionCode, Delivery};
use crate::options::{with_at_least_once_delivery, with_bytes};
use std::time::Duration;
use tokio::sync::mpsc;

fn noop_handler() -> impl MessageHandler {
    handler_fn(|_delivery: Delivery| async { ConsumptionCode::Ack })
}

#[test]
fn test_parse_topic() {
    assert_eq!(parse_topic("kafka://orders").unwrap(), (Scheme::Kafka, "orders"));
    assert_eq!(parse_topic("nats://a.b").unwrap(), (Scheme::Nats, "a.b"));
    assert_eq!(parse_topic("nsq://jobs").unwrap(), (Scheme::Nsq, "jobs"));
    assert_eq!(parse_topic("mem://x://y").unwrap(), (Scheme::Memory, "x://y"));
}

#[test]
fn test_parse_topic_malformed() {
    assert!(matches!(parse_topic("orders"), Err(MqError::TopicParse(_))));
    assert!(matches!(parse_topic("kafka://"), Err(MqError::TopicParse(_))));
    assert!(matches!(parse_topic("://orders"), Err(MqError::TopicParse(_))));
}

#[test]
fn test_parse_topic_unknown_scheme() {
    assert!(matches!(
        parse_topic("redis://orders"),
        Err(MqError::UnsupportedScheme(s)) if s == "redis"
    ));
}

#[test]
fn test_scheme_display_round_trips() {
    for scheme in [Scheme::Kafka, Scheme::Nats, Scheme::Nsq, Scheme::Memory] {
        assert_eq!(scheme.to_string().parse::<Scheme>().unwrap(), scheme);
    }
}

#[tokio::test]
async fn test_unbound_scheme_fails() {
    let router = Router::new();

    let err = router
        .publish("kafka://orders", [with_bytes("x")])
        .await
        .unwrap_err();
    assert!(matches!(err, MqError::NoQueueConfigured(Scheme::Kafka)));
    assert_eq!(err.to_string(), "No kafka queue configured");

    let err = router
        .subscribe("nsq://orders", noop_handler(), [])
        .await
        .err()
        .unwrap();
    assert!(matches!(err, MqError::NoQueueConfigured(Scheme::Nsq)));
}

#[tokio::test]
async fn test_malformed_topic_fails_before_dispatch() {
    let router = Router::new().with_queue(
        Scheme::Memory,
        Arc::new(ChannelQueue::new(ChannelConfig::default())),
    );
    assert!(matches!(
        router.publish("orders", [with_bytes("x")]).await,
        Err(MqError::TopicParse(_))
    ));
    assert!(matches!(
        router.publish("amqp://orders", [with_bytes("x")]).await,
        Err(MqError::UnsupportedScheme(_))
    ));
}

#[tokio::test]
async fn test_routes_to_bound_backend() {
    let router = Router::new().with_queue(
        Scheme::Memory,
        Arc::new(ChannelQueue::new(ChannelConfig::default())),
    );
    assert!(router.is_bound(Scheme::Memory));
    assert!(!router.is_bound(Scheme::Kafka));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |delivery: Delivery| {
        let tx = tx.clone();
        async move {
            if let Ok(msg) = delivery {
                let _ = tx.send(msg.data().map(<[u8]>::to_vec));
            }
            ConsumptionCode::Ack
        }
    });

    let sub = router
        .subscribe("mem://router-demo", handler, [with_at_least_once_delivery()])
        .await
        .unwrap();
    router
        .publish("mem://router-demo", [with_bytes("hello")])
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, Some(b"hello".to_vec()));

    sub.unsubscribe().await.unwrap();
}

#[tokio::test]
async fn test_option_errors_surface_from_router() {
    let router = Router::new().with_queue(
        Scheme::Memory,
        Arc::new(ChannelQueue::new(ChannelConfig::default())),
    );
    let result = router
        .publish("mem://orders", [with_bytes("a"), with_bytes("b")])
        .await;
    assert!(matches!(result, Err(MqError::DataAlreadySet)));
}
