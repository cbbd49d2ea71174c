use async_trait::async_trait;

use crate::envelope::Envelope;
use crate::error::{BusError, Error, Result};

/// One message on its way to the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    /// Partitioning key; unkeyed records are spread across partitions.
    pub key: Option<String>,
    /// Envelope wire form.
    pub payload: Vec<u8>,
}

impl Record {
    pub fn new(topic: impl Into<String>, key: Option<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key,
            payload,
        }
    }

    /// Route an envelope by its `Topic` and `Key` headers.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self> {
        let topic = envelope.topic().ok_or_else(|| {
            Error::Validation(format!("envelope {} has no topic", envelope.message_id()))
        })?;
        Ok(Self::new(
            topic,
            envelope.key().map(str::to_string),
            envelope.to_wire()?,
        ))
    }
}

/// One message read from a partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub partition: u32,
    pub offset: u64,
    pub payload: Vec<u8>,
}

/// Append side of a partitioned broker.
///
/// Appends are at-least-once and ordered within a partition. A returned
/// `Ok` is the broker's acknowledgment.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, record: Record) -> Result<(), BusError>;

    /// Publish in order, stopping at the first failure.
    async fn publish_batch(&self, records: Vec<Record>) -> Result<(), BusError> {
        for record in records {
            self.publish(record).await?;
        }
        Ok(())
    }
}

/// Read side of a partitioned broker with consumer-group offsets.
///
/// Offsets are per partition and increase monotonically. A committed offset
/// is the next offset the group should read.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Broker name recorded in consumed envelope positions.
    fn broker(&self) -> &str;

    async fn partition_count(&self, topic: &str) -> Result<u32, BusError>;

    /// Read up to `max` messages starting at `offset`. An empty result means
    /// nothing new is available.
    async fn fetch(
        &self,
        topic: &str,
        partition: u32,
        offset: u64,
        max: usize,
    ) -> Result<Vec<Delivery>, BusError>;

    /// Offset one past the last message in the partition.
    async fn end_offset(&self, topic: &str, partition: u32) -> Result<u64, BusError>;

    async fn committed(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
    ) -> Result<Option<u64>, BusError>;

    async fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        offset: u64,
    ) -> Result<(), BusError>;
}
