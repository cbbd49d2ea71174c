use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use super::backoff::Backoff;
use super::handler::{HandleOutcome, HandlerRegistry};
use super::offsets::OffsetTracker;
use crate::bus::{Delivery, Publisher, Record, Subscriber};
use crate::config::{AutoOffsetReset, ConsumerConfig};
use crate::envelope::{Envelope, Position};
use crate::error::BusError;
use crate::mailbox::{Mailbox, Reservation};

/// Header naming why an envelope was dead-lettered.
pub const DEAD_LETTER_REASON: &str = "x-dead-letter-reason";

/// Counters reported by a stopped consumer group.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: usize,
    pub handled: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

impl AddAssign for ConsumerStats {
    fn add_assign(&mut self, other: Self) {
        self.received += other.received;
        self.handled += other.handled;
        self.duplicates += other.duplicates;
        self.failed += other.failed;
        self.dead_lettered += other.dead_lettered;
    }
}

enum Settled {
    Done(HandleOutcome),
    Failed(Envelope, String),
    /// Task dropped or panicked before reporting.
    Abandoned,
}

struct Done {
    partition: u32,
    offset: u64,
    settled: Settled,
}

/// Reports a mailbox entry's result to its reader, even if the entry panics.
struct Ack {
    tx: mpsc::UnboundedSender<Done>,
    partition: u32,
    offset: u64,
    settled: Option<Settled>,
}

impl Ack {
    fn finish(mut self, settled: Settled) {
        self.settled = Some(settled);
    }
}

impl Drop for Ack {
    fn drop(&mut self) {
        let _ = self.tx.send(Done {
            partition: self.partition,
            offset: self.offset,
            settled: self.settled.take().unwrap_or(Settled::Abandoned),
        });
    }
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    // A dropped sender also means stop.
    let _ = stop.wait_for(|stopped| *stopped).await;
}

/// Reads a fixed set of partitions and feeds the mailbox.
pub(crate) struct PartitionReader {
    pub(crate) index: usize,
    pub(crate) group_id: String,
    pub(crate) topic: String,
    pub(crate) partitions: Vec<u32>,
    pub(crate) subscriber: Arc<dyn Subscriber>,
    pub(crate) dead_letter: Option<Arc<dyn Publisher>>,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) mailbox: Mailbox,
    pub(crate) config: ConsumerConfig,
}

impl PartitionReader {
    pub(crate) async fn run(self, mut stop: watch::Receiver<bool>) -> ConsumerStats {
        let mut stats = ConsumerStats::default();
        let mut tracker = OffsetTracker::new();
        let mut backoff = Backoff::from_config(&self.config);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        if !self.assign(&mut tracker, &mut backoff, &mut stop).await {
            return stats;
        }
        // Pin the starting position so a restart resumes from it.
        self.commit(&mut tracker).await;
        tracing::debug!(
            reader = self.index,
            topic = %self.topic,
            partitions = ?self.partitions,
            "partition reader started"
        );
        let commit_every = self.config.offset_commit_interval.max(Duration::from_millis(1));
        let mut next_commit = Instant::now() + commit_every;

        'reading: loop {
            tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => break 'reading,
                _ = tokio::time::sleep_until(next_commit) => {
                    self.settle_ready(&mut done_rx, &mut tracker, &mut stats).await;
                    self.commit(&mut tracker).await;
                    next_commit = Instant::now() + commit_every;
                    continue 'reading;
                }
                _ = self.mailbox.wait_for_capacity() => {}
            }

            self.settle_ready(&mut done_rx, &mut tracker, &mut stats).await;
            if Instant::now() >= next_commit {
                self.commit(&mut tracker).await;
                next_commit = Instant::now() + commit_every;
            }

            let mut received = 0;
            let mut throttled = false;
            for &partition in &self.partitions {
                // Other readers share the mailbox, so claim room before fetching.
                let mut reservation = self.mailbox.reserve(self.config.poll_batch_size);
                if reservation.is_empty() {
                    throttled = true;
                    break;
                }

                let offset = tracker.next_offset(partition);
                match self
                    .subscriber
                    .fetch(&self.topic, partition, offset, reservation.len())
                    .await
                {
                    Ok(deliveries) => {
                        for delivery in deliveries {
                            received += 1;
                            self.accept(delivery, &mut reservation, &mut tracker, &mut stats, &done_tx)
                                .await;
                        }
                    }
                    Err(err) => tracing::warn!(
                        error = %err,
                        topic = %self.topic,
                        partition,
                        "broker read failed"
                    ),
                }
            }

            if received > 0 {
                backoff.reset();
                continue;
            }
            if throttled {
                continue;
            }

            let wake = Instant::now() + backoff.next_delay();
            loop {
                tokio::select! {
                    biased;
                    _ = stop_requested(&mut stop) => break 'reading,
                    _ = tokio::time::sleep_until(wake) => break,
                    _ = tokio::time::sleep_until(next_commit) => {
                        self.settle_ready(&mut done_rx, &mut tracker, &mut stats).await;
                        self.commit(&mut tracker).await;
                        next_commit = Instant::now() + commit_every;
                    }
                }
            }
        }

        // Let queued entries finish so their offsets can be committed.
        drop(done_tx);
        while tracker.in_flight() > 0 {
            match done_rx.recv().await {
                Some(done) => self.settle(done, &mut tracker, &mut stats).await,
                None => break,
            }
        }
        self.commit(&mut tracker).await;

        tracing::debug!(reader = self.index, ?stats, "partition reader stopped");
        stats
    }

    async fn assign(
        &self,
        tracker: &mut OffsetTracker,
        backoff: &mut Backoff,
        stop: &mut watch::Receiver<bool>,
    ) -> bool {
        for &partition in &self.partitions {
            loop {
                match self.start_offset(partition).await {
                    Ok(offset) => {
                        tracker.assign(partition, offset);
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(
                            error = %err,
                            topic = %self.topic,
                            partition,
                            "cannot read committed offset"
                        );
                        tokio::select! {
                            _ = stop_requested(stop) => return false,
                            _ = tokio::time::sleep(backoff.next_delay()) => {}
                        }
                    }
                }
            }
        }
        backoff.reset();
        true
    }

    async fn start_offset(&self, partition: u32) -> Result<u64, BusError> {
        let committed = self
            .subscriber
            .committed(&self.group_id, &self.topic, partition)
            .await?;
        match (committed, self.config.auto_offset_reset) {
            (Some(offset), _) => Ok(offset),
            (None, AutoOffsetReset::Earliest) => Ok(0),
            (None, AutoOffsetReset::Latest) => {
                self.subscriber.end_offset(&self.topic, partition).await
            }
        }
    }

    async fn accept(
        &self,
        delivery: Delivery,
        reservation: &mut Reservation,
        tracker: &mut OffsetTracker,
        stats: &mut ConsumerStats,
        done_tx: &mpsc::UnboundedSender<Done>,
    ) {
        let Delivery {
            partition,
            offset,
            payload,
        } = delivery;
        stats.received += 1;
        tracker.begin(partition, offset);

        let envelope = match Envelope::from_wire(&payload) {
            Ok(envelope) => envelope.at_position(Position {
                broker: self.subscriber.broker().to_string(),
                partition,
                offset,
            }),
            Err(err) => {
                tracing::error!(
                    error = %err,
                    topic = %self.topic,
                    partition,
                    offset,
                    "unreadable envelope"
                );
                stats.failed += 1;
                self.dead_letter_raw(payload, stats).await;
                tracker.complete(partition, offset);
                return;
            }
        };

        let lane = format!("{}/{}", self.topic, partition);
        let key = match self.registry.partition_key(&envelope, &lane) {
            Ok(key) => key,
            Err(err) => {
                tracing::error!(
                    error = %err,
                    message_id = %envelope.message_id(),
                    "cannot decode payload"
                );
                stats.failed += 1;
                self.dead_letter(envelope, &err.to_string(), stats).await;
                tracker.complete(partition, offset);
                return;
            }
        };

        let registry = Arc::clone(&self.registry);
        let ack = Ack {
            tx: done_tx.clone(),
            partition,
            offset,
            settled: None,
        };
        let task = async move {
            let settled = match registry.handle(&envelope).await {
                Ok(outcome) => Settled::Done(outcome),
                Err(err) => Settled::Failed(envelope, err.to_string()),
            };
            ack.finish(settled);
        };

        // On error the task is dropped and its ack reports it abandoned.
        if let Err(err) = reservation.enqueue(key, task) {
            tracing::error!(error = %err, partition, offset, "cannot enqueue delivery");
        }
    }

    /// Settle every entry that has already reported back.
    async fn settle_ready(
        &self,
        done_rx: &mut mpsc::UnboundedReceiver<Done>,
        tracker: &mut OffsetTracker,
        stats: &mut ConsumerStats,
    ) {
        while let Ok(done) = done_rx.try_recv() {
            self.settle(done, tracker, stats).await;
        }
    }

    async fn settle(&self, done: Done, tracker: &mut OffsetTracker, stats: &mut ConsumerStats) {
        match done.settled {
            Settled::Done(HandleOutcome::Handled) => stats.handled += 1,
            Settled::Done(HandleOutcome::Duplicate) => stats.duplicates += 1,
            Settled::Failed(envelope, reason) => {
                tracing::error!(
                    message_id = %envelope.message_id(),
                    reason = %reason,
                    "handler failed"
                );
                stats.failed += 1;
                self.dead_letter(envelope, &reason, stats).await;
            }
            Settled::Abandoned => {
                tracing::error!(
                    partition = done.partition,
                    offset = done.offset,
                    "handler did not complete"
                );
                stats.failed += 1;
            }
        }
        tracker.complete(done.partition, done.offset);
    }

    async fn dead_letter(&self, mut envelope: Envelope, reason: &str, stats: &mut ConsumerStats) {
        envelope.set_header(DEAD_LETTER_REASON, reason);
        match envelope.to_wire() {
            Ok(payload) => {
                let key = envelope.key().map(str::to_string);
                self.publish_dead_letter(key, payload, stats).await;
            }
            Err(err) => tracing::error!(
                error = %err,
                message_id = %envelope.message_id(),
                "cannot encode dead letter"
            ),
        }
    }

    async fn dead_letter_raw(&self, payload: Vec<u8>, stats: &mut ConsumerStats) {
        self.publish_dead_letter(None, payload, stats).await;
    }

    async fn publish_dead_letter(
        &self,
        key: Option<String>,
        payload: Vec<u8>,
        stats: &mut ConsumerStats,
    ) {
        let (Some(topic), Some(publisher)) = (&self.config.dead_letter_topic, &self.dead_letter)
        else {
            tracing::error!(topic = %self.topic, "no dead-letter topic, message dropped");
            return;
        };

        match publisher.publish(Record::new(topic.clone(), key, payload)).await {
            Ok(()) => stats.dead_lettered += 1,
            Err(err) => tracing::error!(
                error = %err,
                dead_letter_topic = %topic,
                "dead-letter publish failed"
            ),
        }
    }

    async fn commit(&self, tracker: &mut OffsetTracker) {
        for (partition, offset) in tracker.uncommitted() {
            match self
                .subscriber
                .commit(&self.group_id, &self.topic, partition, offset)
                .await
            {
                Ok(()) => {
                    tracing::trace!(partition, offset, "offset committed");
                    tracker.mark_committed(partition, offset);
                }
                Err(err) => tracing::warn!(
                    error = %err,
                    partition,
                    offset,
                    "offset commit failed"
                ),
            }
        }
    }
}
