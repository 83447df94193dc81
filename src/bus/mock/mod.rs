//! In-memory log broker for testing the Kafka backend.
//!
//! Each topic is one append-only log. Consumer groups keep a shared read
//! cursor (members of a group split the records between them) and a
//! committed position. Failures can be injected for commits, fetches and
//! topic creation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::kafka::{BrokerAddr, BrokerError, LogBroker, LogConsumer, LogProducer, Record, TopicSpec};

#[derive(Default)]
struct MockGroup {
    next: usize,
    committed: Option<i64>,
}

struct MockTopic {
    partitions: usize,
    log: Vec<Vec<u8>>,
    groups: HashMap<String, MockGroup>,
}

#[derive(Default)]
struct MockState {
    topics: HashMap<String, MockTopic>,
    created: Vec<String>,
    consumers_opened: usize,
    fail_commits: usize,
    fail_fetches: usize,
    fail_creation: bool,
    not_controller: bool,
}

#[derive(Default)]
struct Inner {
    state: Mutex<MockState>,
    appended: Notify,
}

/// Mock log broker for testing.
#[derive(Clone, Default)]
pub struct MockLogBroker {
    inner: Arc<Inner>,
}

impl MockLogBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next `n` commits, across all consumers.
    pub fn fail_next_commits(&self, n: usize) {
        self.state().fail_commits = n;
    }

    /// Fail the next `n` fetches, across all consumers.
    pub fn fail_next_fetches(&self, n: usize) {
        self.state().fail_fetches = n;
        self.inner.appended.notify_waiters();
    }

    /// Reject topic creation with a generic error.
    pub fn fail_topic_creation(&self, fail: bool) {
        self.state().fail_creation = fail;
    }

    /// Answer topic creation with "not the controller" (topic is created
    /// anyway, as another broker would have).
    pub fn respond_not_controller(&self, enabled: bool) {
        self.state().not_controller = enabled;
    }

    /// Topics created through [`LogBroker::create_topic`], in order.
    pub fn created_topics(&self) -> Vec<String> {
        self.state().created.clone()
    }

    /// Every payload appended to `topic`.
    pub fn messages(&self, topic: &str) -> Vec<Vec<u8>> {
        self.state()
            .topics
            .get(topic)
            .map(|t| t.log.clone())
            .unwrap_or_default()
    }

    /// Last committed offset of `group` on `topic`.
    pub fn committed(&self, topic: &str, group: &str) -> Option<i64> {
        self.state()
            .topics
            .get(topic)
            .and_then(|t| t.groups.get(group))
            .and_then(|g| g.committed)
    }

    /// Consumer groups that have joined `topic`, sorted.
    pub fn consumer_groups(&self, topic: &str) -> Vec<String> {
        let mut groups: Vec<String> = self
            .state()
            .topics
            .get(topic)
            .map(|t| t.groups.keys().cloned().collect())
            .unwrap_or_default();
        groups.sort();
        groups
    }

    /// Consumers handed out so far.
    pub fn consumers_opened(&self) -> usize {
        self.state().consumers_opened
    }
}

#[async_trait]
impl LogBroker for MockLogBroker {
    async fn create_topic(&self, _broker: &BrokerAddr, spec: &TopicSpec) -> Result<(), BrokerError> {
        let mut state = self.state();
        if state.fail_creation {
            return Err(BrokerError::Other("Mock topic creation failure".to_string()));
        }
        if state.topics.contains_key(&spec.name) {
            return Err(BrokerError::TopicAlreadyExists(spec.name.clone()));
        }

        state.topics.insert(
            spec.name.clone(),
            MockTopic {
                partitions: spec.partitions.max(1) as usize,
                log: Vec::new(),
                groups: HashMap::new(),
            },
        );
        state.created.push(spec.name.clone());

        if state.not_controller {
            return Err(BrokerError::NotController);
        }
        Ok(())
    }

    async fn partition_count(&self, topic: &str) -> Result<usize, BrokerError> {
        self.state()
            .topics
            .get(topic)
            .map(|t| t.partitions)
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))
    }

    fn consumer(&self, topic: &str, group_id: &str) -> Result<Arc<dyn LogConsumer>, BrokerError> {
        let mut state = self.state();
        let entry = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?;
        entry.groups.entry(group_id.to_string()).or_default();
        state.consumers_opened += 1;

        Ok(Arc::new(MockConsumer {
            broker: self.clone(),
            topic: topic.to_string(),
            group_id: group_id.to_string(),
        }))
    }

    fn producer(&self, topic: &str) -> Result<Arc<dyn LogProducer>, BrokerError> {
        Ok(Arc::new(MockProducer {
            broker: self.clone(),
            topic: topic.to_string(),
        }))
    }
}

struct MockConsumer {
    broker: MockLogBroker,
    topic: String,
    group_id: String,
}

impl MockConsumer {
    fn poll(&self) -> Option<Result<Record, BrokerError>> {
        let mut state = self.broker.state();
        if state.fail_fetches > 0 {
            state.fail_fetches -= 1;
            return Some(Err(BrokerError::Other("Mock fetch failure".to_string())));
        }

        let Some(topic) = state.topics.get_mut(&self.topic) else {
            return Some(Err(BrokerError::UnknownTopic(self.topic.clone())));
        };
        let group = topic.groups.entry(self.group_id.clone()).or_default();
        let offset = group.next;
        let payload = topic.log.get(offset)?.clone();
        group.next += 1;

        Some(Ok(Record {
            topic: self.topic.clone(),
            partition: (offset % topic.partitions) as i32,
            offset: offset as i64,
            key: None,
            payload,
        }))
    }
}

#[async_trait]
impl LogConsumer for MockConsumer {
    async fn fetch(&self) -> Result<Record, BrokerError> {
        loop {
            let appended = self.broker.inner.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            if let Some(result) = self.poll() {
                return result;
            }
            appended.await;
        }
    }

    async fn commit(&self, record: &Record) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        if state.fail_commits > 0 {
            state.fail_commits -= 1;
            return Err(BrokerError::Other("Mock commit failure".to_string()));
        }

        let group = state
            .topics
            .get_mut(&self.topic)
            .ok_or_else(|| BrokerError::UnknownTopic(self.topic.clone()))?
            .groups
            .entry(self.group_id.clone())
            .or_default();
        let position = record.offset + 1;
        group.committed = Some(group.committed.map_or(position, |c| c.max(position)));
        Ok(())
    }
}

struct MockProducer {
    broker: MockLogBroker,
    topic: String,
}

#[async_trait]
impl LogProducer for MockProducer {
    async fn send(&self, _key: Option<&[u8]>, payload: &[u8]) -> Result<(), BrokerError> {
        {
            let mut state = self.broker.state();
            let topic = state
                .topics
                .get_mut(&self.topic)
                .ok_or_else(|| BrokerError::UnknownTopic(self.topic.clone()))?;
            topic.log.push(payload.to_vec());
        }
        self.broker.inner.appended.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec(name: &str, partitions: i32) -> TopicSpec {
        TopicSpec {
            name: name.to_string(),
            partitions,
            replication_factor: 1,
        }
    }

    fn addr() -> BrokerAddr {
        "localhost:9092".parse().unwrap()
    }

    #[tokio::test]
    async fn test_create_topic_twice_reports_existing() {
        let broker = MockLogBroker::new();
        broker.create_topic(&addr(), &spec("orders", 2)).await.unwrap();

        let err = broker.create_topic(&addr(), &spec("orders", 2)).await.unwrap_err();
        assert!(matches!(err, BrokerError::TopicAlreadyExists(ref t) if t == "orders"));
        assert_eq!(broker.partition_count("orders").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_group_members_share_cursor() {
        let broker = MockLogBroker::new();
        broker.create_topic(&addr(), &spec("orders", 1)).await.unwrap();
        let producer = broker.producer("orders").unwrap();
        producer.send(None, b"a").await.unwrap();
        producer.send(None, b"b").await.unwrap();

        let first = broker.consumer("orders", "team").unwrap();
        let second = broker.consumer("orders", "team").unwrap();
        let other = broker.consumer("orders", "other").unwrap();

        assert_eq!(first.fetch().await.unwrap().payload, b"a");
        assert_eq!(second.fetch().await.unwrap().payload, b"b");
        assert_eq!(other.fetch().await.unwrap().payload, b"a");
    }

    #[tokio::test]
    async fn test_fetch_waits_for_append() {
        let broker = MockLogBroker::new();
        broker.create_topic(&addr(), &spec("orders", 1)).await.unwrap();
        let consumer = broker.consumer("orders", "team").unwrap();

        let pending = tokio::spawn(async move { consumer.fetch().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.producer("orders").unwrap().send(None, b"late").await.unwrap();

        let record = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(record.payload, b"late");
        assert_eq!(record.offset, 0);
    }

    #[tokio::test]
    async fn test_commit_tracks_highest_position() {
        let broker = MockLogBroker::new();
        broker.create_topic(&addr(), &spec("orders", 1)).await.unwrap();
        let producer = broker.producer("orders").unwrap();
        producer.send(None, b"a").await.unwrap();
        let consumer = broker.consumer("orders", "team").unwrap();
        let record = consumer.fetch().await.unwrap();

        broker.fail_next_commits(1);
        assert!(consumer.commit(&record).await.is_err());
        consumer.commit(&record).await.unwrap();
        assert_eq!(broker.committed("orders", "team"), Some(1));
    }
}
