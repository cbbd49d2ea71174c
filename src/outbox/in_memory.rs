use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::message::{OutboxState, StagedMessage};
use super::store::{
    Document, IsolationLevel, OutboxStore, StoreTransaction, TransactionOptions,
    TransactionalStore,
};
use crate::error::StoreError;

#[derive(Clone, Debug)]
struct Stored {
    version: u64,
    data: Value,
}

#[derive(Default)]
struct Tables {
    documents: HashMap<String, Stored>,
    outbox: Vec<StagedMessage>,
    outbox_index: HashMap<String, usize>,
}

impl Tables {
    fn version_of(&self, id: &str) -> u64 {
        self.documents.get(id).map_or(0, |doc| doc.version)
    }

    fn row_mut(&mut self, id: &str) -> Result<&mut StagedMessage, StoreError> {
        let index = *self
            .outbox_index
            .get(id)
            .ok_or_else(|| StoreError::MissingMessage(id.to_string()))?;
        Ok(&mut self.outbox[index])
    }

    fn upsert_row(&mut self, row: StagedMessage) {
        match self.outbox_index.get(&row.message_id) {
            Some(&index) => self.outbox[index] = row,
            None => {
                self.outbox_index
                    .insert(row.message_id.clone(), self.outbox.len());
                self.outbox.push(row);
            }
        }
    }
}

#[derive(Default)]
struct Inner {
    tables: RwLock<Tables>,
    forced_conflicts: AtomicUsize,
}

/// Versioned document store with an outbox table, held in memory.
///
/// A transaction buffers its reads, writes and staged rows. Commit checks
/// versions and applies everything under one write lock, so business data
/// and outbox rows become visible together.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a document outside any transaction. Returns its new version.
    pub fn seed(&self, id: impl Into<String>, data: Value) -> u64 {
        let mut tables = self.inner.tables.write();
        let id = id.into();
        let version = tables.version_of(&id) + 1;
        tables.documents.insert(id, Stored { version, data });
        version
    }

    pub fn document(&self, id: &str) -> Option<Document> {
        self.inner.tables.read().documents.get(id).map(|doc| Document {
            id: id.to_string(),
            version: doc.version,
            data: doc.data.clone(),
        })
    }

    pub fn document_count(&self) -> usize {
        self.inner.tables.read().documents.len()
    }

    /// Every outbox row in staging order.
    pub fn rows(&self) -> Vec<StagedMessage> {
        self.inner.tables.read().outbox.clone()
    }

    pub fn rows_in(&self, state: OutboxState) -> Vec<StagedMessage> {
        self.inner
            .tables
            .read()
            .outbox
            .iter()
            .filter(|row| row.state == state)
            .cloned()
            .collect()
    }

    pub fn count(&self, state: OutboxState) -> usize {
        self.inner
            .tables
            .read()
            .outbox
            .iter()
            .filter(|row| row.state == state)
            .count()
    }

    /// Make the next `count` commits fail with a version conflict.
    pub fn force_conflicts(&self, count: usize) {
        self.inner.forced_conflicts.store(count, Ordering::SeqCst);
    }

    fn take_forced_conflict(&self) -> bool {
        self.inner
            .forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

enum WriteOp {
    Put(Value),
    Delete,
}

struct PendingWrite {
    expected: u64,
    op: WriteOp,
}

pub struct InMemoryTransaction {
    store: InMemoryStore,
    options: TransactionOptions,
    reads: HashMap<String, u64>,
    writes: HashMap<String, PendingWrite>,
    staged: Vec<StagedMessage>,
}

impl InMemoryTransaction {
    fn record_write(&mut self, id: &str, expected: u64, op: WriteOp) {
        match self.writes.get_mut(id) {
            Some(write) => write.op = op,
            None => {
                self.writes
                    .insert(id.to_string(), PendingWrite { expected, op });
            }
        }
    }

    fn check_versions(&self, tables: &Tables) -> Result<(), StoreError> {
        for (id, write) in &self.writes {
            let actual = tables.version_of(id);
            if actual != write.expected {
                return Err(StoreError::Conflict {
                    id: id.clone(),
                    expected: write.expected,
                    actual,
                });
            }
        }

        if self.options.isolation != IsolationLevel::ReadCommitted {
            for (id, &expected) in &self.reads {
                let actual = tables.version_of(id);
                if actual != expected {
                    return Err(StoreError::Conflict {
                        id: id.clone(),
                        expected,
                        actual,
                    });
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    fn options(&self) -> &TransactionOptions {
        &self.options
    }

    async fn load(&mut self, id: &str) -> Result<Option<Document>, StoreError> {
        if let Some(write) = self.writes.get(id) {
            return Ok(match &write.op {
                WriteOp::Put(data) => Some(Document {
                    id: id.to_string(),
                    version: write.expected,
                    data: data.clone(),
                }),
                WriteOp::Delete => None,
            });
        }

        let stored = self.store.inner.tables.read().documents.get(id).cloned();
        self.reads
            .entry(id.to_string())
            .or_insert_with(|| stored.as_ref().map_or(0, |doc| doc.version));
        Ok(stored.map(|doc| Document {
            id: id.to_string(),
            version: doc.version,
            data: doc.data,
        }))
    }

    async fn put(&mut self, id: &str, data: Value, expected_version: u64) -> Result<(), StoreError> {
        self.record_write(id, expected_version, WriteOp::Put(data));
        Ok(())
    }

    async fn delete(&mut self, id: &str, expected_version: u64) -> Result<(), StoreError> {
        self.record_write(id, expected_version, WriteOp::Delete);
        Ok(())
    }

    async fn stage(&mut self, rows: Vec<StagedMessage>) -> Result<(), StoreError> {
        self.staged.extend(rows);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        if this.store.take_forced_conflict() {
            let id = this
                .writes
                .keys()
                .next()
                .cloned()
                .unwrap_or_else(|| "<forced>".to_string());
            let expected = this.writes.get(&id).map_or(0, |w| w.expected);
            return Err(StoreError::Conflict {
                id,
                expected,
                actual: expected + 1,
            });
        }

        let mut tables = this.store.inner.tables.write();
        this.check_versions(&tables)?;

        for row in &this.staged {
            if tables.outbox_index.contains_key(&row.message_id) {
                return Err(StoreError::Backend(format!(
                    "outbox row {} already exists",
                    row.message_id
                )));
            }
        }

        for (id, write) in this.writes {
            match write.op {
                WriteOp::Put(data) => {
                    let version = write.expected + 1;
                    tables.documents.insert(id, Stored { version, data });
                }
                WriteOp::Delete => {
                    tables.documents.remove(&id);
                }
            }
        }
        for row in this.staged {
            tables.upsert_row(row);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) {
        tracing::trace!(
            writes = self.writes.len(),
            staged = self.staged.len(),
            "in-memory transaction rolled back"
        );
    }
}

#[async_trait]
impl TransactionalStore for InMemoryStore {
    async fn begin(
        &self,
        options: TransactionOptions,
    ) -> Result<Box<dyn StoreTransaction>, StoreError> {
        Ok(Box::new(InMemoryTransaction {
            store: self.clone(),
            options,
            reads: HashMap::new(),
            writes: HashMap::new(),
            staged: Vec::new(),
        }))
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn pending_due(
        &self,
        now: SystemTime,
        limit: usize,
    ) -> Result<Vec<StagedMessage>, StoreError> {
        let tables = self.inner.tables.read();
        let mut waiting: HashSet<&str> = HashSet::new();
        let mut due = Vec::new();
        for row in tables.outbox.iter().filter(|row| row.is_pending()) {
            if due.len() == limit {
                break;
            }
            let held = row.key.as_deref().is_some_and(|key| waiting.contains(key));
            if !held && row.is_due(now) {
                due.push(row.clone());
            } else if let Some(key) = row.key.as_deref() {
                waiting.insert(key);
            }
        }
        Ok(due)
    }

    async fn mark_sent(&self, ids: &[String]) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.write();
        if let Some(missing) = ids.iter().find(|id| !tables.outbox_index.contains_key(id.as_str())) {
            return Err(StoreError::MissingMessage(missing.clone()));
        }
        for id in ids {
            tables.row_mut(id)?.mark_sent();
        }
        Ok(())
    }

    async fn has_pending_before(&self, key: &str, message_id: &str) -> Result<bool, StoreError> {
        let tables = self.inner.tables.read();
        let end = tables
            .outbox_index
            .get(message_id)
            .copied()
            .unwrap_or(tables.outbox.len());
        Ok(tables.outbox[..end]
            .iter()
            .any(|row| row.is_pending() && row.key.as_deref() == Some(key)))
    }

    async fn record_failure(
        &self,
        id: &str,
        error: &str,
        next_attempt_at: SystemTime,
    ) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.write();
        let row = tables.row_mut(id)?;
        if row.is_pending() {
            row.record_failure(error, next_attempt_at);
        }
        Ok(())
    }

    async fn save_failed(&self, rows: Vec<StagedMessage>) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.write();
        for mut row in rows {
            row.state = OutboxState::Failed;
            tables.upsert_row(row);
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<StagedMessage>, StoreError> {
        let tables = self.inner.tables.read();
        Ok(tables
            .outbox_index
            .get(id)
            .map(|&index| tables.outbox[index].clone()))
    }

    async fn by_state(&self, state: OutboxState) -> Result<Vec<StagedMessage>, StoreError> {
        Ok(self
            .inner
            .tables
            .read()
            .outbox
            .iter()
            .filter(|row| row.state == state)
            .cloned()
            .collect())
    }
}
