use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::handler::HandlerRegistry;
use super::reader::{ConsumerStats, PartitionReader};
use crate::bus::{Publisher, Subscriber};
use crate::config::ConsumerConfig;
use crate::error::{Error, Result};
use crate::mailbox::{Mailbox, MailboxConfig};

/// A set of readers sharing one group id, topic, and mailbox.
///
/// Partition `p` is read by reader `p % readers`; partitions are never
/// rebalanced while the group runs.
pub struct ConsumerGroup {
    group_id: String,
    topic: String,
    partitions: Option<u32>,
    readers: usize,
    subscriber: Arc<dyn Subscriber>,
    registry: Arc<HandlerRegistry>,
    mailbox: Option<Mailbox>,
    dead_letter: Option<Arc<dyn Publisher>>,
    config: ConsumerConfig,
}

impl ConsumerGroup {
    pub fn new(
        group_id: impl Into<String>,
        topic: impl Into<String>,
        subscriber: Arc<dyn Subscriber>,
        registry: HandlerRegistry,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            topic: topic.into(),
            partitions: None,
            readers: 1,
            subscriber,
            registry: Arc::new(registry),
            mailbox: None,
            dead_letter: None,
            config: ConsumerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    /// Partition count to read. Asked from the broker when unset.
    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = Some(partitions);
        self
    }

    pub fn with_readers(mut self, readers: usize) -> Self {
        self.readers = readers;
        self
    }

    /// Share a mailbox, e.g. across groups. Built from the config otherwise.
    pub fn with_mailbox(mut self, mailbox: Mailbox) -> Self {
        self.mailbox = Some(mailbox);
        self
    }

    /// Where failed envelopes go when `dead_letter_topic` is configured.
    pub fn with_dead_letter_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.dead_letter = Some(publisher);
        self
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Partitions owned by each reader.
    pub fn assignment(partitions: u32, readers: usize) -> Vec<Vec<u32>> {
        let readers = readers.max(1);
        let mut assigned = vec![Vec::new(); readers];
        for partition in 0..partitions {
            assigned[partition as usize % readers].push(partition);
        }
        assigned
    }

    /// Spawn one task per reader that owns at least one partition.
    pub async fn start(self) -> Result<ConsumerHandle> {
        self.config.validate()?;
        if self.readers == 0 {
            return Err(Error::Validation(format!(
                "consumer group {} needs at least one reader",
                self.group_id
            )));
        }
        if self.config.dead_letter_topic.is_some() && self.dead_letter.is_none() {
            tracing::warn!(
                group = %self.group_id,
                "dead_letter_topic is set but no dead-letter publisher was given"
            );
        }

        let partitions = match self.partitions {
            Some(partitions) => partitions,
            None => self.subscriber.partition_count(&self.topic).await?,
        };
        let mailbox = self
            .mailbox
            .unwrap_or_else(|| Mailbox::new(MailboxConfig::from(&self.config)));
        let (stop_tx, stop_rx) = watch::channel(false);

        let readers: Vec<_> = Self::assignment(partitions, self.readers)
            .into_iter()
            .enumerate()
            .filter(|(_, owned)| !owned.is_empty())
            .map(|(index, owned)| {
                let reader = PartitionReader {
                    index,
                    group_id: self.group_id.clone(),
                    topic: self.topic.clone(),
                    partitions: owned,
                    subscriber: Arc::clone(&self.subscriber),
                    dead_letter: self.dead_letter.clone(),
                    registry: Arc::clone(&self.registry),
                    mailbox: mailbox.clone(),
                    config: self.config.clone(),
                };
                tokio::spawn(reader.run(stop_rx.clone()))
            })
            .collect();

        tracing::info!(
            group = %self.group_id,
            topic = %self.topic,
            partitions,
            readers = readers.len(),
            "consumer group started"
        );

        Ok(ConsumerHandle {
            group_id: self.group_id,
            stop_tx,
            readers,
            mailbox,
        })
    }
}

/// Stop handle for a running consumer group.
pub struct ConsumerHandle {
    group_id: String,
    stop_tx: watch::Sender<bool>,
    readers: Vec<JoinHandle<ConsumerStats>>,
    mailbox: Mailbox,
}

impl ConsumerHandle {
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn signal_stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Signal stop, let in-flight entries finish, and commit final offsets.
    pub async fn stop(self) -> ConsumerStats {
        self.signal_stop();
        self.join().await
    }

    pub async fn join(self) -> ConsumerStats {
        let mut total = ConsumerStats::default();
        for reader in self.readers {
            match reader.await {
                Ok(stats) => total += stats,
                Err(err) => tracing::error!(
                    group = %self.group_id,
                    error = %err,
                    "partition reader task failed"
                ),
            }
        }
        total
    }
}
