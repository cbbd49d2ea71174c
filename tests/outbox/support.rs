#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use reliable_bus::bus::InMemoryBroker;
use reliable_bus::config::OutboxConfig;
use reliable_bus::outbox::{InMemoryStore, OutboxPublisher};
use reliable_bus::{Message, UnitOfWorkFactory};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Message)]
#[message(topic = "accounts")]
pub struct Deposited {
    #[message(key)]
    pub account_id: String,
    pub amount: i64,
}

impl Deposited {
    pub fn new(account_id: &str, amount: i64) -> Self {
        Self {
            account_id: account_id.to_string(),
            amount,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Account {
    pub balance: i64,
}

/// Short timings so the sweeper acts within a test.
pub fn fast_outbox() -> OutboxConfig {
    OutboxConfig {
        sweep_interval: Duration::from_millis(5),
        sweep_min_age: Duration::ZERO,
        retry_base: Duration::from_millis(10),
        retry_cap: Duration::from_millis(40),
        ..OutboxConfig::default()
    }
}

pub struct Bank {
    pub store: InMemoryStore,
    pub broker: InMemoryBroker,
    pub publisher: OutboxPublisher,
    pub factory: UnitOfWorkFactory,
}

impl Bank {
    pub fn new() -> Self {
        let store = InMemoryStore::new();
        let broker = InMemoryBroker::new("test");
        let publisher = OutboxPublisher::with_config(
            Arc::new(broker.clone()),
            Arc::new(store.clone()),
            fast_outbox(),
        );
        let factory = UnitOfWorkFactory::new(Arc::new(store.clone()), publisher.clone());
        Self {
            store,
            broker,
            publisher,
            factory,
        }
    }

    /// Credit `amount` to `account` and raise `Deposited`.
    pub async fn deposit(&self, account: &str, amount: i64) -> reliable_bus::Result<String> {
        let account = account.to_string();
        self.factory
            .execute(move |uow| {
                Box::pin(async move {
                    let (version, mut state) = match uow.load::<Account>(&account).await? {
                        Some(doc) => (doc.version, doc.value),
                        None => (0, Account::default()),
                    };
                    state.balance += amount;
                    uow.save(&account, &state, version).await?;
                    uow.raise(&Deposited::new(&account, amount))
                })
            })
            .await
    }
}

pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not met in time");
}
