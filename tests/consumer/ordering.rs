use std::sync::Arc;
use std::time::Duration;

use reliable_bus::bus::{InMemoryBroker, Subscriber};
use reliable_bus::config::AutoOffsetReset;
use reliable_bus::consumer::{ConsumerGroup, HandlerRegistry};
use tokio::sync::Notify;

use crate::support::{eventually, fast_config, publish, Journal, Transfer, TOPIC};

fn journaling(journal: &Journal) -> HandlerRegistry {
    let journal = journal.clone();
    HandlerRegistry::new().on::<Transfer, _, _>(move |transfer, _| {
        let journal = journal.clone();
        async move {
            journal.push(&transfer.account_id, transfer.seq);
            Ok(())
        }
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_account_runs_in_submission_order() {
    let broker = InMemoryBroker::new("test").with_topic(TOPIC, 3);
    let journal = Journal::default();

    for seq in 0..20 {
        publish(&broker, &Transfer::new("A1", seq)).await;
        publish(&broker, &Transfer::new("B2", seq)).await;
        publish(&broker, &Transfer::new("C3", seq)).await;
    }

    let handle = ConsumerGroup::new("ledger", TOPIC, Arc::new(broker.clone()), journaling(&journal))
        .with_config(fast_config())
        .with_readers(2)
        .start()
        .await
        .unwrap();

    eventually(|| journal.len() == 60).await;
    let stats = handle.stop().await;

    for account in ["A1", "B2", "C3"] {
        assert_eq!(journal.seqs_for(account), (0..20).collect::<Vec<_>>());
    }
    assert_eq!(stats.received, 60);
    assert_eq!(stats.handled, 60);

    for partition in 0..3 {
        assert_eq!(
            broker.committed_offset("ledger", TOPIC, partition),
            Some(broker.end_offset(TOPIC, partition).await.unwrap())
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn other_account_is_not_blocked_by_a_slow_one() {
    let broker = InMemoryBroker::new("test").with_topic(TOPIC, 1);
    let journal = Journal::default();
    let b2_done = Arc::new(Notify::new());

    let registry = {
        let journal = journal.clone();
        let b2_done = Arc::clone(&b2_done);
        HandlerRegistry::new().on::<Transfer, _, _>(move |transfer, _| {
            let journal = journal.clone();
            let b2_done = Arc::clone(&b2_done);
            async move {
                if transfer.account_id == "A1" && transfer.seq == 1 {
                    // Completes only if B2 runs while A1 is still busy.
                    b2_done.notified().await;
                }
                journal.push(&transfer.account_id, transfer.seq);
                if transfer.account_id == "B2" {
                    b2_done.notify_one();
                }
                Ok(())
            }
        })
    };

    publish(&broker, &Transfer::new("A1", 1)).await;
    publish(&broker, &Transfer::new("A1", 2)).await;
    publish(&broker, &Transfer::new("B2", 1)).await;

    let handle = ConsumerGroup::new("ledger", TOPIC, Arc::new(broker.clone()), registry)
        .with_config(fast_config())
        .start()
        .await
        .unwrap();

    eventually(|| journal.len() == 3).await;
    handle.stop().await;

    assert_eq!(
        journal.entries(),
        vec![
            ("B2".to_string(), 1),
            ("A1".to_string(), 1),
            ("A1".to_string(), 2)
        ]
    );
}

#[tokio::test]
async fn latest_reset_skips_existing_messages() {
    let broker = InMemoryBroker::new("test").with_topic(TOPIC, 1);
    let journal = Journal::default();
    publish(&broker, &Transfer::new("A1", 1)).await;
    publish(&broker, &Transfer::new("A1", 2)).await;

    let mut config = fast_config();
    config.auto_offset_reset = AutoOffsetReset::Latest;
    let handle = ConsumerGroup::new("audit", TOPIC, Arc::new(broker.clone()), journaling(&journal))
        .with_config(config)
        .start()
        .await
        .unwrap();

    eventually(|| broker.committed_offset("audit", TOPIC, 0) == Some(2)).await;
    publish(&broker, &Transfer::new("A1", 3)).await;
    eventually(|| journal.len() == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.stop().await;

    assert_eq!(journal.seqs_for("A1"), vec![3]);
}

#[tokio::test]
async fn restart_resumes_from_committed_offset() {
    let broker = InMemoryBroker::new("test").with_topic(TOPIC, 1);
    let journal = Journal::default();
    publish(&broker, &Transfer::new("A1", 1)).await;

    let first = ConsumerGroup::new("ledger", TOPIC, Arc::new(broker.clone()), journaling(&journal))
        .with_config(fast_config())
        .start()
        .await
        .unwrap();
    eventually(|| journal.len() == 1).await;
    first.stop().await;

    publish(&broker, &Transfer::new("A1", 2)).await;
    let second = ConsumerGroup::new("ledger", TOPIC, Arc::new(broker.clone()), journaling(&journal))
        .with_config(fast_config())
        .start()
        .await
        .unwrap();
    eventually(|| journal.len() == 2).await;
    let stats = second.stop().await;

    assert_eq!(journal.seqs_for("A1"), vec![1, 2]);
    assert_eq!(stats.received, 1);
}
