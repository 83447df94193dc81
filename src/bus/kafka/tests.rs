use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::bus::MockLogBroker;
use crate::dlq::DEAD_LETTER_TOPIC;
use crate::message::ConsumptionCode;
use crate::options::{
    with_at_least_once_delivery, with_at_most_once_delivery, with_bytes, with_delay,
    with_json_decoder, PubOption, SubOption,
};
use crate::test_utils::{wait_until, RecordingHandler};

const ACQUIRE_TIMEOUT: Duration = Duration::from_millis(200);

fn config(partitions: i32) -> KafkaConfig {
    KafkaConfig::new(["localhost:9092"])
        .with_partitions(partitions)
        .with_reader_acquire_timeout(ACQUIRE_TIMEOUT)
        .with_stats_period(Duration::ZERO)
}

async fn queue(broker: &MockLogBroker, partitions: i32) -> KafkaQueue {
    KafkaQueue::new(config(partitions), Arc::new(broker.clone()))
        .await
        .unwrap()
}

fn sub(opts: Vec<SubOption>) -> SubOptions {
    SubOptions::build(opts).unwrap()
}

fn payload(data: &str) -> PubOptions {
    PubOptions::build([with_bytes(data)]).unwrap()
}

fn at_least_once() -> SubOptions {
    sub(vec![with_at_least_once_delivery()])
}

// ============================================================================
// Construction
// ============================================================================

#[tokio::test]
async fn test_new_creates_dead_letter_topic_once() {
    let broker = MockLogBroker::new();
    let _first = queue(&broker, 1).await;
    let _second = queue(&broker, 1).await;

    assert_eq!(broker.created_topics(), vec![DEAD_LETTER_TOPIC.to_string()]);
}

#[tokio::test]
async fn test_new_rejects_empty_broker_list() {
    let broker = MockLogBroker::new();
    let config = KafkaConfig::new(Vec::<String>::new());

    let result = KafkaQueue::new(config, Arc::new(broker)).await;
    assert!(matches!(result, Err(MqError::Config(_))));
}

#[tokio::test]
async fn test_not_controller_counts_as_created() {
    let broker = MockLogBroker::new();
    broker.respond_not_controller(true);
    let queue = queue(&broker, 1).await;

    queue.publish("orders", payload("a")).await.unwrap();
    assert_eq!(broker.messages("orders"), vec![b"a".to_vec()]);
}

#[tokio::test]
async fn test_topic_creation_failure_propagates() {
    let broker = MockLogBroker::new();
    let queue = queue(&broker, 1).await;
    broker.fail_topic_creation(true);

    let err = queue.publish("orders", payload("a")).await.unwrap_err();
    assert!(matches!(err, MqError::TopicCreation { ref topic, .. } if topic == "orders"));
}

// ============================================================================
// Publish
// ============================================================================

#[tokio::test]
async fn test_publish_rejects_empty_topic() {
    let queue = queue(&MockLogBroker::new(), 1).await;
    let err = queue.publish("", payload("a")).await.unwrap_err();
    assert!(matches!(err, MqError::EmptyTopic));
}

#[tokio::test]
async fn test_publish_rejects_delay() {
    let queue = queue(&MockLogBroker::new(), 1).await;
    let opts = PubOptions::build([with_bytes("a"), with_delay(Duration::from_secs(1))]).unwrap();

    let err = queue.publish("orders", opts).await.unwrap_err();
    assert!(matches!(err, MqError::Unsupported(_)));
}

#[tokio::test]
async fn test_publish_without_data_fails() {
    let queue = queue(&MockLogBroker::new(), 1).await;
    let opts = PubOptions::build(Vec::<PubOption>::new()).unwrap();

    let err = queue.publish("orders", opts).await.unwrap_err();
    assert!(matches!(err, MqError::MissingData));
}

#[tokio::test]
async fn test_publish_reuses_writer_and_topic() {
    let broker = MockLogBroker::new();
    let queue = queue(&broker, 1).await;

    queue.publish("orders", payload("a")).await.unwrap();
    queue.publish("orders", payload("b")).await.unwrap();

    assert_eq!(broker.messages("orders"), vec![b"a".to_vec(), b"b".to_vec()]);
    assert_eq!(queue.writers.lock().await.len(), 1);
    assert_eq!(
        broker.created_topics(),
        vec![DEAD_LETTER_TOPIC.to_string(), "orders".to_string()]
    );
}

// ============================================================================
// Subscribe
// ============================================================================

#[tokio::test]
async fn test_subscribe_rejects_empty_topic() {
    let queue = queue(&MockLogBroker::new(), 1).await;
    let (handler, _log) = RecordingHandler::acking();

    let result = queue.subscribe("", handler, at_least_once()).await;
    assert!(matches!(result, Err(MqError::EmptyTopic)));
}

#[tokio::test]
async fn test_end_to_end_at_least_once() {
    let broker = MockLogBroker::new();
    let queue = queue(&broker, 1).await;
    let (handler, mut log) = RecordingHandler::acking();

    let subscription = queue.subscribe("demo", handler, at_least_once()).await.unwrap();
    assert_eq!(subscription.topic(), "demo");

    queue.publish("demo", payload("hello")).await.unwrap();
    let message = log.next_message().await;
    assert_eq!(message.data(), Some(&b"hello"[..]));
    assert_eq!(message.topic(), "demo");

    // the reader went back to fetching
    queue.publish("demo", payload("again")).await.unwrap();
    assert_eq!(log.next_message().await.data(), Some(&b"again"[..]));
    log.assert_quiet(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_capacity_bounded_by_partitions() {
    let broker = MockLogBroker::new();
    let queue = queue(&broker, 2).await;

    let (h1, _l1) = RecordingHandler::acking();
    let (h2, _l2) = RecordingHandler::acking();
    let (h3, _l3) = RecordingHandler::acking();
    let first = queue.subscribe("orders", h1, at_least_once()).await.unwrap();
    let _second = queue.subscribe("orders", h2, at_least_once()).await.unwrap();

    let started = tokio::time::Instant::now();
    let err = queue
        .subscribe("orders", h3.clone(), at_least_once())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, MqError::NoReadersAvailable { ref topic } if topic == "orders"));
    assert!(started.elapsed() >= ACQUIRE_TIMEOUT);

    first.unsubscribe().await.unwrap();
    queue.subscribe("orders", h3, at_least_once()).await.unwrap();

    let group = queue.at_least_once_group("orders").await.unwrap();
    assert_eq!(group.capacity(), 2);
    assert_eq!(group.created(), 2);
}

#[tokio::test]
async fn test_at_least_once_fans_out() {
    let broker = MockLogBroker::new();
    let queue = queue(&broker, 2).await;
    let (h1, mut l1) = RecordingHandler::acking();
    let (h2, mut l2) = RecordingHandler::acking();

    let _s1 = queue.subscribe("orders", h1, at_least_once()).await.unwrap();
    let _s2 = queue.subscribe("orders", h2, at_least_once()).await.unwrap();
    queue.publish("orders", payload("x")).await.unwrap();

    assert_eq!(l1.next_message().await.data(), Some(&b"x"[..]));
    assert_eq!(l2.next_message().await.data(), Some(&b"x"[..]));

    let groups = broker.consumer_groups("orders");
    assert_eq!(groups.len(), 2);
    assert!(groups.iter().all(|g| g.starts_with("orders-")));
}

#[tokio::test]
async fn test_at_most_once_defaults_group_to_topic() {
    let broker = MockLogBroker::new();
    let queue = queue(&broker, 1).await;
    let (handler, mut log) = RecordingHandler::acking();

    let _s = queue
        .subscribe("orders", handler, sub(vec![with_at_most_once_delivery("")]))
        .await
        .unwrap();
    queue.publish("orders", payload("x")).await.unwrap();
    log.next_message().await;

    assert_eq!(broker.consumer_groups("orders"), vec!["orders".to_string()]);
    wait_until(|| async { broker.committed("orders", "orders") == Some(1) }).await;
}

#[tokio::test]
async fn test_unset_semantics_default_to_at_most_once() {
    let broker = MockLogBroker::new();
    let queue = queue(&broker, 1).await;
    let (handler, _log) = RecordingHandler::acking();

    let _s = queue
        .subscribe("orders", handler, SubOptions::default())
        .await
        .unwrap();

    let ids = queue.id_group("orders").await.unwrap();
    assert!(ids.open_reader_group("orders").is_ok());
    assert!(queue.at_least_once_group("orders").await.is_none());
}

#[tokio::test]
async fn test_at_most_once_groups_are_independent() {
    let broker = MockLogBroker::new();
    let queue = queue(&broker, 2).await;
    let (ha, mut la) = RecordingHandler::acking();
    let (hb, mut lb) = RecordingHandler::acking();

    let _a = queue
        .subscribe("orders", ha, sub(vec![with_at_most_once_delivery("a")]))
        .await
        .unwrap();
    let _b = queue
        .subscribe("orders", hb, sub(vec![with_at_most_once_delivery("b")]))
        .await
        .unwrap();
    queue.publish("orders", payload("x")).await.unwrap();

    assert_eq!(la.next_message().await.data(), Some(&b"x"[..]));
    assert_eq!(lb.next_message().await.data(), Some(&b"x"[..]));

    let ids = queue.id_group("orders").await.unwrap();
    assert_eq!(ids.len(), 2);
    assert!(matches!(
        ids.open_reader_group("c"),
        Err(MqError::GroupNotFound(ref g)) if g == "c"
    ));
}

#[tokio::test]
async fn test_at_most_once_same_group_shares_pool() {
    let broker = MockLogBroker::new();
    let queue = queue(&broker, 2).await;
    let (h1, mut l1) = RecordingHandler::acking();
    let (h2, mut l2) = RecordingHandler::acking();
    let (h3, _l3) = RecordingHandler::acking();

    let _s1 = queue
        .subscribe("orders", h1, sub(vec![with_at_most_once_delivery("team")]))
        .await
        .unwrap();
    let _s2 = queue
        .subscribe("orders", h2, sub(vec![with_at_most_once_delivery("team")]))
        .await
        .unwrap();

    let ids = queue.id_group("orders").await.unwrap();
    assert_eq!(ids.len(), 1);
    let group = ids.open_reader_group("team").unwrap();
    assert_eq!(group.created(), 2);

    // the pool is exhausted for this team
    let result = queue
        .subscribe("orders", h3, sub(vec![with_at_most_once_delivery("team")]))
        .await;
    assert!(matches!(result, Err(MqError::NoReadersAvailable { .. })));

    // one message goes to exactly one member
    queue.publish("orders", payload("x")).await.unwrap();
    let first = tokio::select! {
        m = l1.next_message() => m,
        m = l2.next_message() => m,
    };
    assert_eq!(first.data(), Some(&b"x"[..]));
    l1.assert_quiet(Duration::from_millis(50)).await;
    l2.assert_quiet(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_add_reader_group_rejects_duplicate() {
    let broker = MockLogBroker::new();
    let queue = queue(&broker, 1).await;
    let (handler, _log) = RecordingHandler::acking();
    let _s = queue
        .subscribe("orders", handler, sub(vec![with_at_most_once_delivery("team")]))
        .await
        .unwrap();

    let ids = queue.id_group("orders").await.unwrap();
    let existing = ids.open_reader_group("team").unwrap();
    assert!(matches!(
        ids.add_reader_group("team", existing),
        Err(MqError::GroupAlreadyExists(ref g)) if g == "team"
    ));
}

// ============================================================================
// Unsubscribe
// ============================================================================

#[tokio::test]
async fn test_double_unsubscribe_fails() {
    let broker = MockLogBroker::new();
    let queue = queue(&broker, 1).await;
    let (handler, _log) = RecordingHandler::acking();

    let subscription = queue.subscribe("orders", handler, at_least_once()).await.unwrap();
    subscription.unsubscribe().await.unwrap();

    let err = subscription.unsubscribe().await.unwrap_err();
    assert!(matches!(err, MqError::InvalidSubscription));
}

#[tokio::test]
async fn test_unsubscribed_reader_is_reused() {
    let broker = MockLogBroker::new();
    let queue = queue(&broker, 1).await;
    let (h1, mut l1) = RecordingHandler::acking();
    let (h2, mut l2) = RecordingHandler::acking();

    let first = queue.subscribe("orders", h1, at_least_once()).await.unwrap();
    first.unsubscribe().await.unwrap();
    let _second = queue.subscribe("orders", h2, at_least_once()).await.unwrap();

    let group = queue.at_least_once_group("orders").await.unwrap();
    assert_eq!(group.created(), 1);
    assert_eq!(broker.consumers_opened(), 1);

    // the old handler was cleared, the new one gets the traffic
    queue.publish("orders", payload("x")).await.unwrap();
    assert_eq!(l2.next_message().await.data(), Some(&b"x"[..]));
    l1.assert_quiet(Duration::from_millis(50)).await;
}

// ============================================================================
// Consumption codes
// ============================================================================

#[tokio::test]
async fn test_ack_commits() {
    let broker = MockLogBroker::new();
    let queue = queue(&broker, 1).await;
    let (handler, mut log) = RecordingHandler::acking();
    let _s = queue
        .subscribe("orders", handler, sub(vec![with_at_most_once_delivery("team")]))
        .await
        .unwrap();

    queue.publish("orders", payload("a")).await.unwrap();
    queue.publish("orders", payload("b")).await.unwrap();
    log.next_message().await;
    log.next_message().await;

    wait_until(|| async { broker.committed("orders", "team") == Some(2) }).await;
}

#[tokio::test]
async fn test_nack_persistent_dead_letters_once() {
    let broker = MockLogBroker::new();
    let queue = queue(&broker, 1).await;
    let (handler, mut log) =
        RecordingHandler::scripted([ConsumptionCode::NackPersistentFailure], ConsumptionCode::Ack);
    let _s = queue
        .subscribe("orders", handler, sub(vec![with_at_most_once_delivery("team")]))
        .await
        .unwrap();

    queue.publish("orders", payload("poison")).await.unwrap();
    queue.publish("orders", payload("fine")).await.unwrap();

    assert_eq!(log.next_message().await.data(), Some(&b"poison"[..]));
    assert_eq!(log.next_message().await.data(), Some(&b"fine"[..]));
    log.assert_quiet(Duration::from_millis(50)).await;

    wait_until(|| async { broker.messages(DEAD_LETTER_TOPIC).len() == 1 }).await;
    assert_eq!(broker.messages(DEAD_LETTER_TOPIC), vec![b"poison".to_vec()]);
    assert_eq!(broker.committed("orders", "team"), Some(2));
}

#[tokio::test]
async fn test_nack_transient_redelivers_without_commit() {
    let broker = MockLogBroker::new();
    let queue = queue(&broker, 1).await;
    let (handler, mut log) = RecordingHandler::scripted(
        [
            ConsumptionCode::NackTransientFailure,
            ConsumptionCode::NackTransientFailure,
        ],
        ConsumptionCode::Ack,
    );
    let _s = queue
        .subscribe("orders", handler, sub(vec![with_at_most_once_delivery("team")]))
        .await
        .unwrap();

    queue.publish("orders", payload("retry-me")).await.unwrap();

    let first = log.next_message().await;
    let second = log.next_message().await;
    let third = log.next_message().await;
    assert_eq!(first.id(), second.id());
    assert_eq!(second.id(), third.id());
    assert_eq!(third.data(), Some(&b"retry-me"[..]));

    wait_until(|| async { broker.committed("orders", "team") == Some(1) }).await;
    assert!(broker.messages(DEAD_LETTER_TOPIC).is_empty());
}

#[tokio::test]
async fn test_unsubscribe_interrupts_endless_redelivery() {
    let broker = MockLogBroker::new();
    let queue = queue(&broker, 1).await;
    let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let handler = crate::message::handler_fn(move |_| {
        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        async { ConsumptionCode::NackTransientFailure }
    });
    let subscription = queue
        .subscribe(
            "orders",
            Arc::new(handler),
            sub(vec![with_at_most_once_delivery("team")]),
        )
        .await
        .unwrap();

    queue.publish("orders", payload("stuck")).await.unwrap();
    wait_until(|| async { calls.load(std::sync::atomic::Ordering::SeqCst) > 10 }).await;

    tokio::time::timeout(Duration::from_secs(2), subscription.unsubscribe())
        .await
        .unwrap()
        .unwrap();

    let ids = queue.id_group("orders").await.unwrap();
    let group = ids.open_reader_group("team").unwrap();
    wait_until(|| async { group.idle() == 1 }).await;

    let settled = calls.load(std::sync::atomic::Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), settled);
    assert_eq!(broker.committed("orders", "team"), None);
}

#[tokio::test]
async fn test_ack_final_stops_reader() {
    let broker = MockLogBroker::new();
    let queue = queue(&broker, 1).await;
    let (handler, mut log) = RecordingHandler::scripted([], ConsumptionCode::AckFinal);
    let subscription = queue.subscribe("orders", handler, at_least_once()).await.unwrap();

    queue.publish("orders", payload("last")).await.unwrap();
    queue.publish("orders", payload("unseen")).await.unwrap();

    assert_eq!(log.next_message().await.data(), Some(&b"last"[..]));
    log.assert_quiet(Duration::from_millis(100)).await;

    let group = queue.at_least_once_group("orders").await.unwrap();
    wait_until(|| async { group.idle() == 1 }).await;

    // first unsubscribe still succeeds after the run ended on its own
    subscription.unsubscribe().await.unwrap();
}

#[tokio::test]
async fn test_commit_failure_is_reported_and_reader_returns() {
    let broker = MockLogBroker::new();
    let queue = queue(&broker, 1).await;
    let (handler, mut log) = RecordingHandler::acking();
    let _s = queue.subscribe("orders", handler, at_least_once()).await.unwrap();

    broker.fail_next_commits(3);
    queue.publish("orders", payload("a")).await.unwrap();

    log.next_message().await;
    assert!(matches!(log.next_error().await, MqError::Commit(_)));

    let group = queue.at_least_once_group("orders").await.unwrap();
    wait_until(|| async { group.idle() == 1 }).await;
}

#[tokio::test]
async fn test_commit_retried_before_failing() {
    let broker = MockLogBroker::new();
    let queue = queue(&broker, 1).await;
    let (handler, mut log) = RecordingHandler::acking();
    let _s = queue
        .subscribe("orders", handler, sub(vec![with_at_most_once_delivery("team")]))
        .await
        .unwrap();

    broker.fail_next_commits(2);
    queue.publish("orders", payload("a")).await.unwrap();
    queue.publish("orders", payload("b")).await.unwrap();

    log.next_message().await;
    assert_eq!(log.next_message().await.data(), Some(&b"b"[..]));
    wait_until(|| async { broker.committed("orders", "team") == Some(2) }).await;
}

#[tokio::test]
async fn test_persistent_failure_with_commit_failure_still_dead_letters() {
    let broker = MockLogBroker::new();
    let queue = queue(&broker, 1).await;
    let (handler, mut log) =
        RecordingHandler::scripted([ConsumptionCode::NackPersistentFailure], ConsumptionCode::Ack);
    let _s = queue.subscribe("orders", handler, at_least_once()).await.unwrap();

    broker.fail_next_commits(3);
    queue.publish("orders", payload("poison")).await.unwrap();

    log.next_message().await;
    assert!(matches!(log.next_error().await, MqError::Commit(_)));
    wait_until(|| async { broker.messages(DEAD_LETTER_TOPIC).len() == 1 }).await;

    let group = queue.at_least_once_group("orders").await.unwrap();
    wait_until(|| async { group.idle() == 1 }).await;
}

#[tokio::test]
async fn test_fetch_failure_reported_once() {
    let broker = MockLogBroker::new();
    let queue = queue(&broker, 1).await;
    let (handler, mut log) = RecordingHandler::acking();
    let _s = queue.subscribe("orders", handler, at_least_once()).await.unwrap();

    broker.fail_next_fetches(1);

    assert!(matches!(log.next_error().await, MqError::Fetch(_)));
    log.assert_quiet(Duration::from_millis(50)).await;

    let group = queue.at_least_once_group("orders").await.unwrap();
    wait_until(|| async { group.idle() == 1 }).await;
}

// ============================================================================
// Decoding
// ============================================================================

#[derive(Debug, PartialEq, serde::Deserialize)]
struct Order {
    id: u32,
}

#[tokio::test]
async fn test_decoder_fills_value() {
    let broker = MockLogBroker::new();
    let queue = queue(&broker, 1).await;
    let (handler, mut log) = RecordingHandler::acking();
    let opts = sub(vec![with_at_least_once_delivery(), with_json_decoder::<Order>()]);
    let _s = queue.subscribe("orders", handler, opts).await.unwrap();

    queue.publish("orders", payload(r#"{"id":7}"#)).await.unwrap();

    let message = log.next_message().await;
    assert_eq!(message.value::<Order>(), Some(&Order { id: 7 }));
    assert_eq!(message.data(), None);
}

#[tokio::test]
async fn test_undecodable_payload_is_dead_lettered() {
    let broker = MockLogBroker::new();
    let queue = queue(&broker, 1).await;
    let (handler, mut log) = RecordingHandler::acking();
    let opts = sub(vec![with_at_most_once_delivery("team"), with_json_decoder::<Order>()]);
    let _s = queue.subscribe("orders", handler, opts).await.unwrap();

    queue.publish("orders", payload("not json")).await.unwrap();
    queue.publish("orders", payload(r#"{"id":1}"#)).await.unwrap();

    assert!(matches!(log.next_error().await, MqError::Codec(_)));
    assert_eq!(
        log.next_message().await.value::<Order>(),
        Some(&Order { id: 1 })
    );

    wait_until(|| async { broker.messages(DEAD_LETTER_TOPIC).len() == 1 }).await;
    assert_eq!(broker.messages(DEAD_LETTER_TOPIC), vec![b"not json".to_vec()]);
    wait_until(|| async { broker.committed("orders", "team") == Some(2) }).await;
}
