use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::message::{OutboxState, StagedMessage};
use crate::error::StoreError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Only written documents are version-checked at commit.
    #[default]
    ReadCommitted,
    /// Documents read in the transaction must also be unchanged at commit.
    RepeatableRead,
    Serializable,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionScope {
    /// Join the caller's transaction when there is one.
    #[default]
    Required,
    /// Always open an independent transaction.
    RequiresNew,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    pub isolation: IsolationLevel,
    pub scope: TransactionScope,
    pub timeout: Option<Duration>,
}

impl TransactionOptions {
    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_scope(mut self, scope: TransactionScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A business document and the version it was read at. Version `0` means
/// the document does not exist.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    pub id: String,
    pub version: u64,
    pub data: serde_json::Value,
}

/// An open storage transaction.
///
/// Business writes and staged outbox rows commit together or not at all.
#[async_trait]
pub trait StoreTransaction: Send {
    fn options(&self) -> &TransactionOptions;

    async fn load(&mut self, id: &str) -> Result<Option<Document>, StoreError>;

    /// Write a document. `expected_version` is the version it was read at,
    /// `0` for a new document.
    async fn put(
        &mut self,
        id: &str,
        data: serde_json::Value,
        expected_version: u64,
    ) -> Result<(), StoreError>;

    async fn delete(&mut self, id: &str, expected_version: u64) -> Result<(), StoreError>;

    /// Append outbox rows to this transaction.
    async fn stage(&mut self, rows: Vec<StagedMessage>) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>);
}

#[async_trait]
pub trait TransactionalStore: Send + Sync {
    async fn begin(
        &self,
        options: TransactionOptions,
    ) -> Result<Box<dyn StoreTransaction>, StoreError>;
}

/// Outbox table access outside a business transaction.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Pending rows whose retry time has passed, oldest first.
    ///
    /// A row queued behind an earlier pending row with the same key that is
    /// not yet due is held back with it.
    async fn pending_due(
        &self,
        now: SystemTime,
        limit: usize,
    ) -> Result<Vec<StagedMessage>, StoreError>;

    /// Move acknowledged rows from `Pending` to `Sent`. Rows in any other
    /// state are left alone.
    ///
    /// Unknown ids fail the whole call and no row changes.
    async fn mark_sent(&self, ids: &[String]) -> Result<(), StoreError>;

    /// Whether a `Pending` row with `key` was staged before `message_id`.
    async fn has_pending_before(&self, key: &str, message_id: &str) -> Result<bool, StoreError>;

    /// Count a failed send and schedule the next attempt.
    async fn record_failure(
        &self,
        id: &str,
        error: &str,
        next_attempt_at: SystemTime,
    ) -> Result<(), StoreError>;

    /// Persist compensation rows outside the rolled-back transaction.
    async fn save_failed(&self, rows: Vec<StagedMessage>) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<StagedMessage>, StoreError>;

    async fn by_state(&self, state: OutboxState) -> Result<Vec<StagedMessage>, StoreError>;
}
