//! In-memory partitioned broker for tests and single-process use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::transport::{Delivery, Publisher, Record, Subscriber};
use crate::envelope::Envelope;
use crate::error::BusError;

#[derive(Clone, Debug)]
struct Stored {
    key: Option<String>,
    payload: Vec<u8>,
}

struct Inner {
    name: String,
    default_partitions: u32,
    auto_create: AtomicBool,
    topics: RwLock<HashMap<String, Vec<Vec<Stored>>>>,
    committed: Mutex<HashMap<(String, String, u32), u64>>,
    fail_next: AtomicUsize,
    round_robin: AtomicU32,
}

/// Partitioned, append-only topics with consumer-group offsets.
///
/// Keyed records always land on the same partition of a topic. Cloning
/// shares the underlying log.
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// use reliable_bus::bus::{InMemoryBroker, Publisher, Record};
///
/// let broker = InMemoryBroker::new("local").with_topic("orders", 3);
/// broker.publish(Record::new("orders", Some("A1".into()), b"{}".to_vec())).await.unwrap();
/// assert_eq!(broker.len("orders"), 1);
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new("in-memory")
    }
}

impl InMemoryBroker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                default_partitions: 1,
                auto_create: AtomicBool::new(true),
                topics: RwLock::new(HashMap::new()),
                committed: Mutex::new(HashMap::new()),
                fail_next: AtomicUsize::new(0),
                round_robin: AtomicU32::new(0),
            }),
        }
    }

    /// Declare a topic with a fixed partition count. Existing topics keep
    /// their partitions.
    pub fn with_topic(self, topic: impl Into<String>, partitions: u32) -> Self {
        self.create_topic(topic, partitions);
        self
    }

    /// Reject publishes to undeclared topics instead of creating them with
    /// one partition.
    pub fn strict(self) -> Self {
        self.inner.auto_create.store(false, Ordering::SeqCst);
        self
    }

    pub fn create_topic(&self, topic: impl Into<String>, partitions: u32) {
        self.inner
            .topics
            .write()
            .entry(topic.into())
            .or_insert_with(|| vec![Vec::new(); partitions.max(1) as usize]);
    }

    /// Make the next `count` publish calls fail with a connection error.
    pub fn fail_next_publishes(&self, count: usize) {
        self.inner.fail_next.store(count, Ordering::SeqCst);
    }

    /// Append raw bytes to a partition, bypassing envelope encoding.
    pub fn append(&self, topic: &str, partition: u32, payload: Vec<u8>) -> Result<u64, BusError> {
        let mut topics = self.inner.topics.write();
        let partitions = topics
            .get_mut(topic)
            .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))?;
        let log = partitions
            .get_mut(partition as usize)
            .ok_or_else(|| BusError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            })?;
        log.push(Stored { key: None, payload });
        Ok(log.len() as u64 - 1)
    }

    /// Messages across all partitions of a topic.
    pub fn len(&self, topic: &str) -> usize {
        self.inner
            .topics
            .read()
            .get(topic)
            .map_or(0, |partitions| partitions.iter().map(Vec::len).sum())
    }

    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }

    /// Decoded envelopes of a topic, partition by partition.
    pub fn envelopes(&self, topic: &str) -> Vec<Envelope> {
        self.inner
            .topics
            .read()
            .get(topic)
            .map(|partitions| {
                partitions
                    .iter()
                    .flatten()
                    .filter_map(|stored| Envelope::from_wire(&stored.payload).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Keys of a single partition in append order.
    pub fn keys(&self, topic: &str, partition: u32) -> Vec<Option<String>> {
        self.inner
            .topics
            .read()
            .get(topic)
            .and_then(|partitions| partitions.get(partition as usize))
            .map(|log| log.iter().map(|stored| stored.key.clone()).collect())
            .unwrap_or_default()
    }

    pub fn committed_offset(&self, group: &str, topic: &str, partition: u32) -> Option<u64> {
        self.inner
            .committed
            .lock()
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    fn partition_for(&self, key: Option<&str>, partitions: u32) -> u32 {
        match key {
            Some(key) => fnv1a(key.as_bytes()) % partitions,
            None => self.inner.round_robin.fetch_add(1, Ordering::Relaxed) % partitions,
        }
    }

    fn take_injected_failure(&self) -> bool {
        self.inner
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Stable across processes, unlike the std hasher.
fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[async_trait]
impl Publisher for InMemoryBroker {
    async fn publish(&self, record: Record) -> Result<(), BusError> {
        if self.take_injected_failure() {
            return Err(BusError::ConnectionFailed("injected failure".into()));
        }

        if self.inner.auto_create.load(Ordering::SeqCst) {
            self.create_topic(record.topic.clone(), self.inner.default_partitions);
        }

        let mut topics = self.inner.topics.write();
        let partitions = topics
            .get_mut(&record.topic)
            .ok_or_else(|| BusError::UnknownTopic(record.topic.clone()))?;
        let partition = self.partition_for(record.key.as_deref(), partitions.len() as u32);
        partitions[partition as usize].push(Stored {
            key: record.key,
            payload: record.payload,
        });

        tracing::trace!(topic = %record.topic, partition, "record appended");
        Ok(())
    }
}

#[async_trait]
impl Subscriber for InMemoryBroker {
    fn broker(&self) -> &str {
        &self.inner.name
    }

    async fn partition_count(&self, topic: &str) -> Result<u32, BusError> {
        self.inner
            .topics
            .read()
            .get(topic)
            .map(|partitions| partitions.len() as u32)
            .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))
    }

    async fn fetch(
        &self,
        topic: &str,
        partition: u32,
        offset: u64,
        max: usize,
    ) -> Result<Vec<Delivery>, BusError> {
        let topics = self.inner.topics.read();
        let log = topics
            .get(topic)
            .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))?
            .get(partition as usize)
            .ok_or_else(|| BusError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            })?;

        Ok(log
            .iter()
            .enumerate()
            .skip(offset as usize)
            .take(max)
            .map(|(index, stored)| Delivery {
                partition,
                offset: index as u64,
                payload: stored.payload.clone(),
            })
            .collect())
    }

    async fn end_offset(&self, topic: &str, partition: u32) -> Result<u64, BusError> {
        self.inner
            .topics
            .read()
            .get(topic)
            .and_then(|partitions| partitions.get(partition as usize))
            .map(|log| log.len() as u64)
            .ok_or_else(|| BusError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            })
    }

    async fn committed(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
    ) -> Result<Option<u64>, BusError> {
        Ok(self.committed_offset(group, topic, partition))
    }

    async fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        offset: u64,
    ) -> Result<(), BusError> {
        let mut committed = self.inner.committed.lock();
        let slot = committed
            .entry((group.to_string(), topic.to_string(), partition))
            .or_insert(0);
        // Offsets never move backwards.
        *slot = (*slot).max(offset);
        Ok(())
    }
}
