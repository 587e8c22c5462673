//! In-process broker with Kafka-like semantics: partitioned append-only logs,
//! key-hash partitioning, per-group committed offsets and explicit commits.
//!
//! Every member of a group is assigned every partition of its subscription,
//! so run one consumer per group. Used by the test suites and by `BROKER=memory`.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::client::{
    AdminError, ChannelConsumer, ChannelProducer, ConsumeError, ConsumerFactory, ProduceError,
    TopicAdmin,
};
use crate::types::{ChannelMessage, OutboundRecord, Partition, TopicSpec};

#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    default_partitions: i32,
    topics: RwLock<HashMap<String, MemoryTopic>>,
    committed: Mutex<HashMap<String, HashMap<Partition, i64>>>,
    // bumped on every append so waiting consumers wake up
    wakeup: watch::Sender<u64>,
    failing_sends: AtomicUsize,
    round_robin: AtomicUsize,
}

struct MemoryTopic {
    spec: TopicSpec,
    partitions: Vec<Vec<OutboundRecord>>,
}

impl MemoryTopic {
    fn new(spec: TopicSpec) -> Self {
        let count = spec.partitions.max(1) as usize;
        Self {
            spec,
            partitions: vec![Vec::new(); count],
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(1)
    }
}

impl MemoryBroker {
    /// `default_partitions` applies to topics auto-created on first produce.
    pub fn new(default_partitions: i32) -> Self {
        let (wakeup, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                default_partitions: default_partitions.max(1),
                topics: RwLock::new(HashMap::new()),
                committed: Mutex::new(HashMap::new()),
                wakeup,
                failing_sends: AtomicUsize::new(0),
                round_robin: AtomicUsize::new(0),
            }),
        }
    }

    pub fn consumer(&self, group_id: &str) -> MemoryConsumer {
        MemoryConsumer {
            broker: self.clone(),
            group_id: group_id.to_owned(),
            subscription: Mutex::new(Vec::new()),
            positions: Mutex::new(HashMap::new()),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            heartbeats: AtomicU64::new(0),
            wakeups: tokio::sync::Mutex::new(self.inner.wakeup.subscribe()),
        }
    }

    /// Makes the next `count` calls to `send` fail for every record.
    pub fn fail_next_sends(&self, count: usize) {
        self.inner.failing_sends.store(count, Ordering::SeqCst);
    }

    pub fn topic_spec(&self, name: &str) -> Option<TopicSpec> {
        self.read_topics().get(name).map(|t| t.spec.clone())
    }

    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read_topics().keys().cloned().collect();
        names.sort();
        names
    }

    /// All messages of a topic, partition by partition, in offset order.
    pub fn messages(&self, topic: &str) -> Vec<ChannelMessage> {
        let topics = self.read_topics();
        let Some(memory_topic) = topics.get(topic) else {
            return Vec::new();
        };
        memory_topic
            .partitions
            .iter()
            .enumerate()
            .flat_map(|(idx, log)| {
                let partition = Partition::new(topic.to_owned(), idx as i32);
                log.iter()
                    .enumerate()
                    .map(move |(offset, record)| to_message(&partition, offset as i64, record))
            })
            .collect()
    }

    pub fn message_count(&self, topic: &str) -> usize {
        self.read_topics()
            .get(topic)
            .map(|t| t.partitions.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn committed_offset(&self, group_id: &str, partition: &Partition) -> Option<i64> {
        lock(&self.inner.committed)
            .get(group_id)
            .and_then(|offsets| offsets.get(partition))
            .copied()
    }

    fn read_topics(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, MemoryTopic>> {
        self.inner.topics.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_topics(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, MemoryTopic>> {
        self.inner
            .topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self) {
        self.inner.wakeup.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn append(&self, channel: &str, records: Vec<OutboundRecord>) {
        let mut topics = self.write_topics();
        let topic = topics.entry(channel.to_owned()).or_insert_with(|| {
            debug!(topic = channel, "auto-creating topic on first produce");
            MemoryTopic::new(TopicSpec::new(channel).partitions(self.inner.default_partitions))
        });
        let count = topic.partitions.len();
        for record in records {
            let idx = match &record.key {
                Some(key) => {
                    let mut hasher = DefaultHasher::new();
                    key.hash(&mut hasher);
                    (hasher.finish() % count as u64) as usize
                }
                None => self.inner.round_robin.fetch_add(1, Ordering::Relaxed) % count,
            };
            topic.partitions[idx].push(record);
        }
    }
}

fn to_message(partition: &Partition, offset: i64, record: &OutboundRecord) -> ChannelMessage {
    ChannelMessage {
        partition: partition.clone(),
        offset,
        key: record.key.as_ref().map(|k| k.as_bytes().to_vec()),
        payload: Some(record.payload.clone()),
        headers: record.headers.clone(),
        timestamp: record.timestamp,
    }
}

#[async_trait]
impl ChannelProducer for MemoryBroker {
    async fn connect(&self) -> Result<(), ProduceError> {
        Ok(())
    }

    async fn send(
        &self,
        channel: &str,
        records: Vec<OutboundRecord>,
    ) -> Vec<Result<(), ProduceError>> {
        let failing = self
            .inner
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return records
                .iter()
                .map(|_| Err(ProduceError::Unavailable(format!("{channel} rejected send"))))
                .collect();
        }

        let count = records.len();
        self.append(channel, records);
        self.wake();
        (0..count).map(|_| Ok(())).collect()
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), ProduceError> {
        Ok(())
    }
}

#[async_trait]
impl TopicAdmin for MemoryBroker {
    async fn create_topics_if_needed(
        &self,
        specs: &[TopicSpec],
    ) -> Result<Vec<String>, AdminError> {
        let mut topics = self.write_topics();
        let mut created = Vec::new();
        for spec in specs {
            if topics.contains_key(&spec.name) {
                continue;
            }
            info!(topic = %spec.name, partitions = spec.partitions, "created topic");
            topics.insert(spec.name.clone(), MemoryTopic::new(spec.clone()));
            created.push(spec.name.clone());
        }
        Ok(created)
    }
}

impl ConsumerFactory for MemoryBroker {
    fn create_consumer(&self, group_id: &str) -> Result<Arc<dyn ChannelConsumer>, ConsumeError> {
        Ok(Arc::new(self.consumer(group_id)))
    }
}

pub struct MemoryConsumer {
    broker: MemoryBroker,
    group_id: String,
    subscription: Mutex<Vec<String>>,
    positions: Mutex<HashMap<Partition, i64>>,
    paused: AtomicBool,
    closed: AtomicBool,
    heartbeats: AtomicU64,
    wakeups: tokio::sync::Mutex<watch::Receiver<u64>>,
}

impl MemoryConsumer {
    pub fn heartbeats(&self) -> u64 {
        self.heartbeats.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn fetch(&self, max_messages: usize) -> Vec<ChannelMessage> {
        let subscription = lock(&self.subscription).clone();
        let topics = self.broker.read_topics();
        let mut positions = lock(&self.positions);
        let mut batch = Vec::new();

        for name in subscription {
            let Some(topic) = topics.get(&name) else {
                continue;
            };
            for (idx, log) in topic.partitions.iter().enumerate() {
                if batch.len() >= max_messages {
                    return batch;
                }
                let partition = Partition::new(name.clone(), idx as i32);
                let position = positions.entry(partition.clone()).or_insert_with(|| {
                    self.broker
                        .committed_offset(&self.group_id, &partition)
                        .unwrap_or(0)
                });
                while (*position as usize) < log.len() && batch.len() < max_messages {
                    batch.push(to_message(
                        &partition,
                        *position,
                        &log[*position as usize],
                    ));
                    *position += 1;
                }
            }
        }
        batch
    }
}

#[async_trait]
impl ChannelConsumer for MemoryConsumer {
    async fn connect(&self) -> Result<(), ConsumeError> {
        Ok(())
    }

    fn subscribe(&self, channels: &[String]) -> Result<(), ConsumeError> {
        *lock(&self.subscription) = channels.to_vec();
        Ok(())
    }

    async fn recv_batch(
        &self,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Vec<ChannelMessage>, ConsumeError> {
        if lock(&self.subscription).is_empty() {
            return Err(ConsumeError::NotSubscribed);
        }
        let deadline = tokio::time::Instant::now() + timeout;
        let mut wakeups = self.wakeups.lock().await;

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ConsumeError::Closed);
            }
            wakeups.borrow_and_update();
            if !self.is_paused() {
                let batch = self.fetch(max_messages);
                if !batch.is_empty() {
                    return Ok(batch);
                }
            }
            match tokio::time::timeout_at(deadline, wakeups.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return Ok(Vec::new()),
            }
        }
    }

    fn commit(&self, offsets: &HashMap<Partition, i64>) -> Result<(), ConsumeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConsumeError::Closed);
        }
        let mut committed = lock(&self.broker.inner.committed);
        let group = committed.entry(self.group_id.clone()).or_default();
        for (partition, offset) in offsets {
            group.insert(partition.clone(), *offset);
        }
        Ok(())
    }

    fn heartbeat(&self) {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
    }

    fn pause(&self) -> Result<(), ConsumeError> {
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn resume(&self) -> Result<(), ConsumeError> {
        self.paused.store(false, Ordering::SeqCst);
        self.broker.wake();
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.broker.wake();
    }
}
