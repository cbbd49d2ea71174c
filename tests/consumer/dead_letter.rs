use std::sync::Arc;

use reliable_bus::bus::InMemoryBroker;
use reliable_bus::consumer::{ConsumerGroup, HandlerRegistry, DEAD_LETTER_REASON};
use reliable_bus::{DomainFailure, Message};
use serde::{Deserialize, Serialize};

use crate::support::{eventually, fast_config, publish, Journal, Transfer, TOPIC};

const DLQ: &str = "transfers.dlq";

#[derive(Debug, Clone, Serialize, Deserialize, Message)]
#[message(topic = "transfers")]
struct Unhandled {
    note: String,
}

fn rejecting_negative(journal: &Journal) -> HandlerRegistry {
    let journal = journal.clone();
    HandlerRegistry::new().on::<Transfer, _, _>(move |transfer, _| {
        let journal = journal.clone();
        async move {
            if transfer.amount < 0 {
                return Err(DomainFailure::new(7, "negative amount").into());
            }
            journal.push(&transfer.account_id, transfer.seq);
            Ok(())
        }
    })
}

#[tokio::test]
async fn failures_go_to_the_dead_letter_topic_and_offsets_advance() {
    let broker = InMemoryBroker::new("test").with_topic(TOPIC, 1);
    let journal = Journal::default();

    let bad = publish(
        &broker,
        &Transfer {
            amount: -5,
            ..Transfer::new("A1", 1)
        },
    )
    .await;
    broker.append(TOPIC, 0, b"not an envelope".to_vec()).unwrap();
    publish(
        &broker,
        &Unhandled {
            note: "nobody listens".into(),
        },
    )
    .await;
    publish(&broker, &Transfer::new("A1", 2)).await;

    let mut config = fast_config();
    config.dead_letter_topic = Some(DLQ.to_string());
    let handle = ConsumerGroup::new("ledger", TOPIC, Arc::new(broker.clone()), rejecting_negative(&journal))
        .with_config(config)
        .with_dead_letter_publisher(Arc::new(broker.clone()))
        .start()
        .await
        .unwrap();

    eventually(|| broker.len(DLQ) == 3 && journal.len() == 1).await;
    let stats = handle.stop().await;

    assert_eq!(journal.seqs_for("A1"), vec![2]);
    assert_eq!(stats.failed, 3);
    assert_eq!(stats.dead_lettered, 3);
    assert_eq!(broker.committed_offset("ledger", TOPIC, 0), Some(4));

    let parked = broker.envelopes(DLQ);
    let rejected = parked
        .iter()
        .find(|e| e.message_id() == bad.message_id())
        .expect("rejected transfer is dead-lettered");
    assert!(rejected
        .header(DEAD_LETTER_REASON)
        .unwrap()
        .contains("negative amount"));
    assert!(parked
        .iter()
        .any(|e| e.payload_type() == Some("Unhandled")));
}

#[tokio::test]
async fn without_dead_letter_topic_failures_are_dropped_but_not_retried() {
    let broker = InMemoryBroker::new("test").with_topic(TOPIC, 1);
    let journal = Journal::default();
    publish(
        &broker,
        &Transfer {
            amount: -1,
            ..Transfer::new("A1", 1)
        },
    )
    .await;

    let handle = ConsumerGroup::new("ledger", TOPIC, Arc::new(broker.clone()), rejecting_negative(&journal))
        .with_config(fast_config())
        .start()
        .await
        .unwrap();
    eventually(|| broker.committed_offset("ledger", TOPIC, 0) == Some(1)).await;
    let stats = handle.stop().await;

    assert_eq!(stats.failed, 1);
    assert_eq!(stats.dead_lettered, 0);
    assert!(journal.entries().is_empty());
}
