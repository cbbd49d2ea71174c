use std::time::Duration;

use reliable_bus::outbox::{OutboxState, OutboxSweeper};

use crate::support::{eventually, fast_outbox, Bank, Deposited};

#[tokio::test]
async fn broker_outage_leaves_rows_pending_until_the_sweeper_delivers() {
    let bank = Bank::new();
    bank.broker.fail_next_publishes(2);

    let first = bank.deposit("A1", 10).await.unwrap();
    let second = bank.deposit("B2", 5).await.unwrap();
    bank.publisher.drain(Duration::from_secs(1)).await.unwrap();

    // Commit stands even though nothing reached the broker.
    assert_eq!(bank.store.document("A1").unwrap().data["balance"], 10);
    assert_eq!(bank.store.count(OutboxState::Pending), 2);
    assert!(bank.broker.is_empty("accounts"));
    assert!(bank
        .store
        .rows()
        .iter()
        .all(|row| row.attempts == 1 && row.last_error.is_some()));

    let sweeper = OutboxSweeper::new(bank.publisher.clone(), fast_outbox()).spawn();
    eventually(|| bank.store.count(OutboxState::Sent) == 2).await;
    let stats = sweeper.stop().await;

    assert!(stats.published >= 2);
    let mut delivered: Vec<String> = bank
        .broker
        .envelopes("accounts")
        .iter()
        .map(|e| e.message_id().to_string())
        .collect();
    delivered.sort();
    let mut expected = vec![first, second];
    expected.sort();
    assert_eq!(delivered, expected);
}

#[tokio::test]
async fn same_key_rows_keep_their_order_across_retries() {
    let bank = Bank::new();
    bank.broker.fail_next_publishes(1);

    let ids = bank
        .factory
        .execute(|uow| {
            Box::pin(async move {
                let mut ids = Vec::new();
                for amount in [1, 2, 3] {
                    ids.push(uow.raise(&Deposited::new("A1", amount))?);
                }
                Ok(ids)
            })
        })
        .await
        .unwrap();
    bank.publisher.drain(Duration::from_secs(1)).await.unwrap();
    assert!(bank.broker.is_empty("accounts"));

    let sweeper = OutboxSweeper::new(bank.publisher.clone(), fast_outbox()).spawn();
    eventually(|| bank.store.count(OutboxState::Sent) == 3).await;
    sweeper.stop().await;

    let amounts: Vec<i64> = bank
        .broker
        .envelopes("accounts")
        .iter()
        .map(|e| e.decode::<Deposited>().unwrap().amount)
        .collect();
    assert_eq!(amounts, vec![1, 2, 3]);
    let delivered: Vec<String> = bank
        .broker
        .envelopes("accounts")
        .iter()
        .map(|e| e.message_id().to_string())
        .collect();
    assert_eq!(delivered, ids);
}

#[tokio::test]
async fn sweep_leaves_fresh_rows_to_the_post_commit_send() {
    let bank = Bank::new();
    bank.broker.fail_next_publishes(1);
    bank.deposit("A1", 10).await.unwrap();
    bank.publisher.drain(Duration::from_secs(1)).await.unwrap();

    let patient = OutboxSweeper::new(
        bank.publisher.clone(),
        reliable_bus::config::OutboxConfig {
            sweep_min_age: Duration::from_secs(60),
            ..fast_outbox()
        },
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    let report = patient.sweep_once().await.unwrap();

    assert_eq!(report.sent, 0);
    assert_eq!(bank.store.count(OutboxState::Pending), 1);
}

fn amounts_for(bank: &Bank, account: &str) -> Vec<i64> {
    bank.broker
        .envelopes("accounts")
        .iter()
        .filter(|e| e.key() == Some(account))
        .map(|e| e.decode::<Deposited>().unwrap().amount)
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn back_to_back_commits_for_one_key_publish_in_commit_order() {
    let bank = Bank::new();

    for amount in 0..20 {
        bank.deposit("A1", amount).await.unwrap();
    }
    bank.publisher.drain(Duration::from_secs(2)).await.unwrap();

    assert_eq!(amounts_for(&bank, "A1"), (0..20).collect::<Vec<_>>());
    assert_eq!(bank.store.count(OutboxState::Sent), 20);
}

#[tokio::test]
async fn later_commit_waits_behind_an_undelivered_row_for_the_same_key() {
    let bank = Bank::new();
    bank.broker.fail_next_publishes(1);

    bank.deposit("A1", 1).await.unwrap();
    bank.publisher.drain(Duration::from_secs(1)).await.unwrap();
    bank.deposit("A1", 2).await.unwrap();
    bank.publisher.drain(Duration::from_secs(1)).await.unwrap();

    assert!(bank.broker.is_empty("accounts"));
    assert_eq!(bank.store.count(OutboxState::Pending), 2);

    let sweeper = OutboxSweeper::new(bank.publisher.clone(), fast_outbox()).spawn();
    eventually(|| bank.store.count(OutboxState::Sent) == 2).await;
    sweeper.stop().await;

    assert_eq!(amounts_for(&bank, "A1"), vec![1, 2]);
}
