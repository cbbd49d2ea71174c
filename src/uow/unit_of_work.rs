use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::buffer::EventBuffer;
use crate::envelope::{Envelope, Message};
use crate::error::{Error, FailureKind, Result};
use crate::outbox::{OutboxPublisher, StagedMessage, StoreTransaction};

/// Lifecycle of a unit of work.
///
/// `Open → BeforeCommit → Committing → Committed | RolledBack → AfterCommit → Closed`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UowState {
    Open,
    BeforeCommit,
    Committing,
    Committed,
    RolledBack,
    AfterCommit,
    Closed,
}

/// Called on every state change.
pub type StateObserver = Arc<dyn Fn(UowState) + Send + Sync>;

/// What a successful commit staged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReport {
    /// Ids of every staged row, normal events first.
    pub message_ids: Vec<String>,
    pub normal: usize,
    pub anyway: usize,
}

/// A typed document with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// Envelope defaults applied to raised events.
#[derive(Debug, Clone, Default)]
pub(crate) struct Routing {
    pub default_topic: Option<String>,
    pub producer: Option<String>,
    pub ip: Option<String>,
}

struct Context {
    publisher: OutboxPublisher,
    events: EventBuffer,
    cause: Option<Envelope>,
    routing: Routing,
    state: UowState,
    observer: Option<StateObserver>,
}

/// Transactional boundary around one business operation.
///
/// Raised events are staged as outbox rows in the same transaction as the
/// business writes. After a successful commit they are handed to the
/// publisher in the background. When the commit or the handler fails, the
/// transaction is rolled back and only compensation rows are written:
/// events raised with [`raise_anyway`](Self::raise_anyway) plus the
/// notification declared by a [`DomainFailure`](crate::DomainFailure).
pub struct UnitOfWork {
    tx: Box<dyn StoreTransaction>,
    ctx: Context,
}

impl UnitOfWork {
    pub(crate) fn new(
        tx: Box<dyn StoreTransaction>,
        publisher: OutboxPublisher,
        routing: Routing,
    ) -> Self {
        Self {
            tx,
            ctx: Context {
                publisher,
                events: EventBuffer::new(),
                cause: None,
                routing,
                state: UowState::Open,
                observer: None,
            },
        }
    }

    pub fn state(&self) -> UowState {
        self.ctx.state
    }

    pub fn observe(&mut self, observer: impl Fn(UowState) + Send + Sync + 'static) {
        self.ctx.observer = Some(Arc::new(observer));
    }

    /// The underlying transaction, for raw document access.
    pub fn tx(&mut self) -> &mut dyn StoreTransaction {
        &mut *self.tx
    }

    pub async fn load<T: DeserializeOwned>(&mut self, id: &str) -> Result<Option<Versioned<T>>> {
        let Some(document) = self.tx.load(id).await? else {
            return Ok(None);
        };
        let value = serde_json::from_value(document.data)
            .map_err(|e| Error::deserialization(std::any::type_name::<T>(), e))?;
        Ok(Some(Versioned {
            version: document.version,
            value,
        }))
    }

    /// Write a document read at `expected_version` (`0` when new).
    pub async fn save<T: Serialize>(
        &mut self,
        id: &str,
        value: &T,
        expected_version: u64,
    ) -> Result<()> {
        let data = serde_json::to_value(value)
            .map_err(|e| Error::Validation(format!("cannot serialize document {}: {}", id, e)))?;
        self.tx.put(id, data, expected_version).await?;
        Ok(())
    }

    pub async fn delete(&mut self, id: &str, expected_version: u64) -> Result<()> {
        self.tx.delete(id, expected_version).await?;
        Ok(())
    }

    /// Raise an event published only on commit. Returns its message id.
    pub fn raise<M: Message>(&mut self, event: &M) -> Result<String> {
        let envelope = self.ctx.route(Envelope::new(event)?)?;
        Ok(self.ctx.events.push(envelope).message_id().to_string())
    }

    /// Raise an event published whether or not the commit succeeds.
    pub fn raise_anyway<M: Message>(&mut self, event: &M) -> Result<String> {
        let envelope = self.ctx.route(Envelope::new(event)?)?;
        Ok(self.ctx.events.push_anyway(envelope).message_id().to_string())
    }

    /// Take every event out of an aggregate's buffer.
    pub fn absorb(&mut self, buffer: &mut EventBuffer) -> Result<()> {
        let (normal, anyway) = buffer.take().into_parts();
        for envelope in normal {
            let envelope = self.ctx.route(envelope)?;
            self.ctx.events.push(envelope);
        }
        for envelope in anyway {
            let envelope = self.ctx.route(envelope)?;
            self.ctx.events.push_anyway(envelope);
        }
        Ok(())
    }

    /// Correlate every raised event with the message being handled.
    pub fn caused_by(&mut self, cause: &Envelope) {
        self.ctx.cause = Some(cause.clone());
    }

    pub fn events(&self) -> &EventBuffer {
        &self.ctx.events
    }

    /// Stage events, commit, then publish in the background.
    pub async fn commit(self) -> Result<CommitReport> {
        let UnitOfWork { mut tx, mut ctx } = self;

        ctx.transition(UowState::BeforeCommit);
        ctx.apply_cause();
        let rows: Vec<StagedMessage> = ctx
            .events
            .normal()
            .iter()
            .chain(ctx.events.anyway())
            .map(StagedMessage::pending)
            .collect();

        if let Err(err) = tx.stage(rows.clone()).await {
            tx.rollback().await;
            return Err(ctx.abort(err.into()).await);
        }

        ctx.transition(UowState::Committing);
        if let Err(err) = tx.commit().await {
            return Err(ctx.abort(err.into()).await);
        }
        ctx.transition(UowState::Committed);

        let report = CommitReport {
            message_ids: rows.iter().map(|row| row.message_id.clone()).collect(),
            normal: ctx.events.normal().len(),
            anyway: ctx.events.anyway().len(),
        };

        ctx.transition(UowState::AfterCommit);
        ctx.publisher.dispatch(rows);
        ctx.transition(UowState::Closed);
        Ok(report)
    }

    /// Roll back because the handler failed, writing compensation rows.
    /// Returns `error` for the caller to propagate.
    pub async fn fail(self, error: Error) -> Error {
        let UnitOfWork { tx, mut ctx } = self;
        tx.rollback().await;
        ctx.apply_cause();
        ctx.abort(error).await
    }

    /// Discard everything, including `raise_anyway` events.
    pub async fn rollback(self) {
        let UnitOfWork { tx, mut ctx } = self;
        tx.rollback().await;
        ctx.transition(UowState::RolledBack);
        ctx.transition(UowState::Closed);
    }
}

impl Context {
    fn transition(&mut self, next: UowState) {
        tracing::trace!(from = ?self.state, to = ?next, "unit of work state change");
        self.state = next;
        if let Some(observer) = &self.observer {
            observer(next);
        }
    }

    fn route(&self, mut envelope: Envelope) -> Result<Envelope> {
        if envelope.topic().is_none() {
            let topic = self.routing.default_topic.as_ref().ok_or_else(|| {
                Error::Validation(format!(
                    "event {} declares no topic and no default topic is configured",
                    envelope.payload_type().unwrap_or("<unknown>")
                ))
            })?;
            envelope = envelope.with_topic(topic.clone());
        }
        if let (Some(producer), None) = (&self.routing.producer, envelope.producer()) {
            envelope = envelope.with_provenance(
                producer.clone(),
                self.routing.ip.clone().unwrap_or_default(),
            );
        }
        Ok(envelope)
    }

    fn correlate(&self, envelope: Envelope) -> Envelope {
        match &self.cause {
            Some(cause) if envelope.correlation_id().is_none() => envelope.caused_by(cause),
            _ => envelope,
        }
    }

    fn apply_cause(&mut self) {
        let Some(cause) = self.cause.clone() else {
            return;
        };
        self.events.for_each_mut(|envelope| {
            if envelope.correlation_id().is_none() {
                *envelope = envelope.clone().caused_by(&cause);
            }
        });
    }

    async fn abort(&mut self, error: Error) -> Error {
        self.transition(UowState::RolledBack);

        match error.kind() {
            FailureKind::Domain | FailureKind::ConcurrencyConflict | FailureKind::Validation => {
                tracing::debug!(error = %error, "unit of work rolled back");
            }
            _ => {
                tracing::warn!(error = %error, "unit of work rolled back");
            }
        }

        let mut compensation: Vec<Envelope> = self.events.anyway().to_vec();
        if let Some(notification) = error.notification() {
            match self.route(notification.clone()) {
                Ok(envelope) => compensation.push(self.correlate(envelope)),
                Err(err) => tracing::error!(
                    error = %err,
                    "failure notification cannot be routed"
                ),
            }
        }

        if !compensation.is_empty() {
            let reason = error.to_string();
            let rows: Vec<StagedMessage> = compensation
                .iter()
                .map(|envelope| StagedMessage::failed(envelope, reason.clone()))
                .collect();

            if let Err(err) = self.publisher.store().save_failed(rows.clone()).await {
                tracing::error!(error = %err, "failed to persist compensation rows");
            }
            // Failures are logged by the publisher and not retried here.
            self.publisher.publish_now(rows).await;
        }

        self.transition(UowState::AfterCommit);
        self.transition(UowState::Closed);
        error
    }
}
