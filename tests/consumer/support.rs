#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reliable_bus::bus::{InMemoryBroker, Publisher, Record};
use reliable_bus::config::ConsumerConfig;
use reliable_bus::{Envelope, Message};
use serde::{Deserialize, Serialize};

pub const TOPIC: &str = "transfers";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Message)]
#[message(topic = "transfers")]
pub struct Transfer {
    #[message(key)]
    pub account_id: String,
    pub seq: u32,
    pub amount: i64,
}

impl Transfer {
    pub fn new(account_id: &str, seq: u32) -> Self {
        Self {
            account_id: account_id.to_string(),
            seq,
            amount: 10,
        }
    }
}

/// Order in which handlers ran, as `(account, seq)`.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<(String, u32)>>>);

impl Journal {
    pub fn push(&self, account: &str, seq: u32) {
        self.0.lock().push((account.to_string(), seq));
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn entries(&self) -> Vec<(String, u32)> {
        self.0.lock().clone()
    }

    pub fn seqs_for(&self, account: &str) -> Vec<u32> {
        self.0
            .lock()
            .iter()
            .filter(|(a, _)| a == account)
            .map(|(_, seq)| *seq)
            .collect()
    }
}

pub fn fast_config() -> ConsumerConfig {
    ConsumerConfig {
        wait_interval: Duration::from_millis(5),
        back_off_increment: Duration::from_millis(5),
        max_wait: Duration::from_millis(20),
        offset_commit_interval: Duration::from_millis(10),
        ..ConsumerConfig::default()
    }
}

pub async fn publish<M: Message>(broker: &InMemoryBroker, message: &M) -> Envelope {
    let envelope = Envelope::new(message).unwrap();
    publish_envelope(broker, &envelope).await;
    envelope
}

pub async fn publish_envelope(broker: &InMemoryBroker, envelope: &Envelope) {
    broker
        .publish(Record::from_envelope(envelope).unwrap())
        .await
        .unwrap();
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not met in time");
}
