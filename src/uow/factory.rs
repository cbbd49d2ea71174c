use std::sync::Arc;

use futures::future::BoxFuture;

use super::unit_of_work::{Routing, UnitOfWork};
use crate::error::Result;
use crate::outbox::{OutboxPublisher, TransactionOptions, TransactionalStore};

/// Opens units of work against one store and publisher.
#[derive(Clone)]
pub struct UnitOfWorkFactory {
    store: Arc<dyn TransactionalStore>,
    publisher: OutboxPublisher,
    options: TransactionOptions,
    routing: Routing,
}

impl UnitOfWorkFactory {
    pub fn new(store: Arc<dyn TransactionalStore>, publisher: OutboxPublisher) -> Self {
        Self {
            store,
            publisher,
            options: TransactionOptions::default(),
            routing: Routing::default(),
        }
    }

    /// Options used by [`begin`](Self::begin).
    pub fn with_options(mut self, options: TransactionOptions) -> Self {
        self.options = options;
        self
    }

    /// Topic for raised events that do not declare one.
    pub fn with_default_topic(mut self, topic: impl Into<String>) -> Self {
        self.routing.default_topic = Some(topic.into());
        self
    }

    /// Stamp `Producer` and `IP` on raised events.
    pub fn with_provenance(mut self, producer: impl Into<String>, ip: impl Into<String>) -> Self {
        self.routing.producer = Some(producer.into());
        self.routing.ip = Some(ip.into());
        self
    }

    pub fn publisher(&self) -> &OutboxPublisher {
        &self.publisher
    }

    pub async fn begin(&self) -> Result<UnitOfWork> {
        self.begin_with(self.options.clone()).await
    }

    pub async fn begin_with(&self, options: TransactionOptions) -> Result<UnitOfWork> {
        let tx = self.store.begin(options).await?;
        Ok(UnitOfWork::new(
            tx,
            self.publisher.clone(),
            self.routing.clone(),
        ))
    }

    /// Run `handler` inside a fresh unit of work and commit it. A handler
    /// error goes through [`UnitOfWork::fail`].
    ///
    /// ```ignore
    /// factory
    ///     .execute(|uow| Box::pin(async move {
    ///         uow.raise(&Deposited { account_id: "A1".into(), amount: 10 })?;
    ///         Ok(())
    ///     }))
    ///     .await?;
    /// ```
    pub async fn execute<T, F>(&self, handler: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut UnitOfWork) -> BoxFuture<'a, Result<T>>,
    {
        self.execute_with(self.options.clone(), handler).await
    }

    pub async fn execute_with<T, F>(&self, options: TransactionOptions, handler: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut UnitOfWork) -> BoxFuture<'a, Result<T>>,
    {
        let mut uow = self.begin_with(options).await?;
        match handler(&mut uow).await {
            Ok(value) => {
                uow.commit().await?;
                Ok(value)
            }
            Err(err) => Err(uow.fail(err).await),
        }
    }
}
