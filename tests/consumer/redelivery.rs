use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use reliable_bus::bus::InMemoryBroker;
use reliable_bus::consumer::{ConsumerGroup, HandlerRegistry, InMemoryProcessedLog};

use crate::support::{eventually, fast_config, publish, publish_envelope, Transfer, TOPIC};

#[derive(Clone, Default)]
struct Balances(Arc<Mutex<HashMap<String, i64>>>);

impl Balances {
    fn of(&self, account: &str) -> i64 {
        self.0.lock().get(account).copied().unwrap_or_default()
    }
}

fn crediting(balances: &Balances, log: &Arc<InMemoryProcessedLog>) -> HandlerRegistry {
    let balances = balances.clone();
    HandlerRegistry::new()
        .on::<Transfer, _, _>(move |transfer, _| {
            let balances = balances.clone();
            async move {
                *balances.0.lock().entry(transfer.account_id.clone()).or_default() += transfer.amount;
                Ok(())
            }
        })
        .with_processed_log(log.clone())
}

#[tokio::test]
async fn duplicate_message_id_is_applied_once() {
    let broker = InMemoryBroker::new("test").with_topic(TOPIC, 1);
    let balances = Balances::default();
    let log = Arc::new(InMemoryProcessedLog::new());

    let envelope = publish(&broker, &Transfer::new("A1", 1)).await;
    // At-least-once: the same envelope arrives twice.
    publish_envelope(&broker, &envelope).await;

    let handle = ConsumerGroup::new("ledger", TOPIC, Arc::new(broker.clone()), crediting(&balances, &log))
        .with_config(fast_config())
        .start()
        .await
        .unwrap();
    eventually(|| broker.committed_offset("ledger", TOPIC, 0) == Some(2)).await;
    let stats = handle.stop().await;

    assert_eq!(balances.of("A1"), 10);
    assert_eq!(stats.handled, 1);
    assert_eq!(stats.duplicates, 1);
}

#[tokio::test]
async fn replay_from_uncommitted_offsets_has_no_effect() {
    let broker = InMemoryBroker::new("test").with_topic(TOPIC, 1);
    let balances = Balances::default();
    let log = Arc::new(InMemoryProcessedLog::new());
    for seq in 0..3 {
        publish(&broker, &Transfer::new("A1", seq)).await;
    }

    let first = ConsumerGroup::new("ledger", TOPIC, Arc::new(broker.clone()), crediting(&balances, &log))
        .with_config(fast_config())
        .start()
        .await
        .unwrap();
    eventually(|| log.len() == 3).await;
    first.stop().await;

    // A fresh group has no committed offsets and re-reads everything, as a
    // crash before the offset commit would.
    let replay = ConsumerGroup::new("ledger-replay", TOPIC, Arc::new(broker.clone()), crediting(&balances, &log))
        .with_config(fast_config())
        .start()
        .await
        .unwrap();
    eventually(|| broker.committed_offset("ledger-replay", TOPIC, 0) == Some(3)).await;
    let stats = replay.stop().await;

    assert_eq!(balances.of("A1"), 30);
    assert_eq!(stats.duplicates, 3);
    assert_eq!(stats.handled, 0);
}
