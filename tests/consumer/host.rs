use std::sync::Arc;
use std::time::Duration;

use reliable_bus::bus::InMemoryBroker;
use reliable_bus::config::OutboxConfig;
use reliable_bus::consumer::{ConsumerGroup, HandlerRegistry};
use reliable_bus::outbox::{InMemoryStore, OutboxPublisher, OutboxState};
use reliable_bus::{Message, MessagingHost, UnitOfWorkFactory};
use serde::{Deserialize, Serialize};

use crate::support::{eventually, fast_config, Transfer, TOPIC};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Ledger {
    balance: i64,
    entries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Message)]
#[message(topic = "ledger")]
struct Credited {
    #[message(key)]
    account_id: String,
    balance: i64,
}

/// Applies each transfer to the account's ledger document and announces
/// the new balance.
fn posting(factory: &UnitOfWorkFactory) -> HandlerRegistry {
    let factory = factory.clone();
    HandlerRegistry::new().on::<Transfer, _, _>(move |transfer, envelope| {
        let factory = factory.clone();
        async move {
            factory
                .execute(move |uow| {
                    Box::pin(async move {
                        uow.caused_by(&envelope);
                        let id = format!("ledger/{}", transfer.account_id);
                        let (version, mut ledger) = match uow.load::<Ledger>(&id).await? {
                            Some(doc) => (doc.version, doc.value),
                            None => (0, Ledger::default()),
                        };
                        ledger.balance += transfer.amount;
                        ledger.entries += 1;
                        uow.save(&id, &ledger, version).await?;
                        uow.raise(&Credited {
                            account_id: transfer.account_id.clone(),
                            balance: ledger.balance,
                        })?;
                        Ok(())
                    })
                })
                .await
        }
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn commands_flow_through_outbox_consumer_and_back_out() {
    let broker = InMemoryBroker::new("test").with_topic(TOPIC, 2);
    let store = InMemoryStore::new();
    let publisher = OutboxPublisher::new(Arc::new(broker.clone()), Arc::new(store.clone()));
    let factory = UnitOfWorkFactory::new(Arc::new(store.clone()), publisher.clone());

    let group = ConsumerGroup::new("ledger", TOPIC, Arc::new(broker.clone()), posting(&factory))
        .with_config(fast_config());
    let mut host = MessagingHost::builder()
        .consumer_group(group)
        .outbox(
            publisher,
            OutboxConfig {
                sweep_interval: Duration::from_millis(10),
                ..OutboxConfig::default()
            },
        )
        .build();
    host.start().await.unwrap();

    let mut transfer_ids = Vec::new();
    for (account, seq) in [("A1", 1), ("B2", 1), ("A1", 2)] {
        let id = factory
            .execute(move |uow| {
                Box::pin(async move { uow.raise(&Transfer::new(account, seq)) })
            })
            .await
            .unwrap();
        transfer_ids.push(id);
    }

    eventually(|| broker.len("ledger") == 3).await;
    let report = host.shutdown(Duration::from_secs(2)).await.unwrap();

    assert_eq!(report.consumers.handled, 3);
    assert_eq!(report.consumers.failed, 0);

    let a1 = store.document("ledger/A1").unwrap();
    assert_eq!(a1.data["balance"], 20);
    assert_eq!(a1.data["entries"], 2);

    let credited = broker.envelopes("ledger");
    let mut balances: Vec<i64> = credited
        .iter()
        .filter(|e| e.key() == Some("A1"))
        .map(|e| e.decode::<Credited>().unwrap().balance)
        .collect();
    balances.sort_unstable();
    assert_eq!(balances, vec![10, 20]);
    for envelope in &credited {
        let cause = envelope.correlation_id().unwrap();
        assert!(transfer_ids.iter().any(|id| id == cause));
    }

    assert_eq!(store.count(OutboxState::Pending), 0);
    assert_eq!(store.count(OutboxState::Sent), 6);
}
