use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::message::{OutboxState, StagedMessage};
use super::store::OutboxStore;
use crate::bus::{Publisher, Record};
use crate::config::OutboxConfig;
use crate::error::{Error, Result};

/// Outcome of one publish batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    /// Acknowledged by the broker.
    pub sent: usize,
    /// Rejected by the broker; rows stay `Pending` with a retry time.
    pub failed: usize,
    /// Held back behind an earlier pending row for the same key.
    pub deferred: usize,
}

/// What the background lane needs. Holds no sender, so the lane ends once
/// every publisher handle is dropped.
struct Shared {
    transport: Arc<dyn Publisher>,
    store: Arc<dyn OutboxStore>,
    retry: OutboxConfig,
    in_flight: watch::Sender<usize>,
}

struct Inner {
    shared: Arc<Shared>,
    lane: Mutex<Option<mpsc::UnboundedSender<Vec<StagedMessage>>>>,
}

/// Hands staged rows to the broker and records the outcome in the outbox.
///
/// A row becomes `Sent` only after the broker acknowledges it. A failed
/// send leaves the row `Pending` with `next_attempt_at` pushed back so the
/// sweeper retries it. Once a key fails, later rows with that key in the
/// same batch are deferred so they cannot overtake it.
///
/// Post-commit batches go through one lane and leave in dispatch order. A
/// batch whose key still has an older `Pending` row is left to the sweeper.
#[derive(Clone)]
pub struct OutboxPublisher {
    inner: Arc<Inner>,
}

impl OutboxPublisher {
    pub fn new(transport: Arc<dyn Publisher>, store: Arc<dyn OutboxStore>) -> Self {
        Self::with_config(transport, store, OutboxConfig::default())
    }

    pub fn with_config(
        transport: Arc<dyn Publisher>,
        store: Arc<dyn OutboxStore>,
        retry: OutboxConfig,
    ) -> Self {
        let (in_flight, _) = watch::channel(0usize);
        Self {
            inner: Arc::new(Inner {
                shared: Arc::new(Shared {
                    transport,
                    store,
                    retry,
                    in_flight,
                }),
                lane: Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn OutboxStore> {
        &self.inner.shared.store
    }

    /// Publish in the background. Returns immediately; use
    /// [`drain`](Self::drain) to wait for outstanding sends.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch(&self, rows: Vec<StagedMessage>) {
        if rows.is_empty() {
            return;
        }

        self.inner.shared.in_flight.send_modify(|n| *n += 1);
        let mut lane = self.inner.lane.lock();
        let rows = match lane.as_ref() {
            Some(tx) => match tx.send(rows) {
                Ok(()) => return,
                Err(mpsc::error::SendError(rows)) => rows,
            },
            None => rows,
        };

        // First dispatch, or the previous lane went away with its runtime.
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_lane(Arc::clone(&self.inner.shared), rx));
        if let Err(mpsc::error::SendError(rows)) = tx.send(rows) {
            tracing::error!(rows = rows.len(), "outbox lane closed, rows left to the sweeper");
            self.inner.shared.settle_one();
        }
        *lane = Some(tx);
    }

    /// Background sends not yet finished.
    pub fn outstanding(&self) -> usize {
        *self.inner.shared.in_flight.borrow()
    }

    /// Wait for every dispatched send to finish.
    pub async fn drain(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.inner.shared.in_flight.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0))
            .await
            .map(|_| ());
        match waited {
            Ok(()) => Ok(()),
            Err(_) => {
                tracing::error!(
                    outstanding = self.outstanding(),
                    ?timeout,
                    "outbox publisher did not drain in time"
                );
                Err(Error::ShutdownTimeout(timeout))
            }
        }
    }

    /// Send one batch now, in order.
    pub async fn publish_now(&self, rows: Vec<StagedMessage>) -> PublishReport {
        self.inner.shared.publish(rows, HashSet::new()).await
    }
}

/// Sends post-commit batches one at a time, in the order they were
/// dispatched.
async fn run_lane(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Vec<StagedMessage>>) {
    while let Some(rows) = rx.recv().await {
        let report = shared.publish_committed(rows).await;
        tracing::debug!(
            sent = report.sent,
            failed = report.failed,
            deferred = report.deferred,
            "post-commit publish finished"
        );
        shared.settle_one();
    }
}

impl Shared {
    fn settle_one(&self) {
        self.in_flight.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Like [`publish`](Self::publish), but keys that still have an older
    /// `Pending` row are not sent at all. Those rows wait for the sweeper,
    /// which delivers them after the older row.
    async fn publish_committed(&self, rows: Vec<StagedMessage>) -> PublishReport {
        let mut checked: HashSet<&str> = HashSet::new();
        let mut held: HashSet<String> = HashSet::new();
        for row in &rows {
            let Some(key) = row.key.as_deref() else {
                continue;
            };
            if !checked.insert(key) {
                continue;
            }
            match self.store.has_pending_before(key, &row.message_id).await {
                Ok(false) => {}
                Ok(true) => {
                    tracing::debug!(key, message_id = %row.message_id, "older row pending, leaving key to the sweeper");
                    held.insert(key.to_string());
                }
                Err(err) => {
                    tracing::warn!(key, error = %err, "cannot check for older pending rows, leaving key to the sweeper");
                    held.insert(key.to_string());
                }
            }
        }
        self.publish(rows, held).await
    }

    async fn publish(
        &self,
        rows: Vec<StagedMessage>,
        mut blocked_keys: HashSet<String>,
    ) -> PublishReport {
        let mut report = PublishReport::default();
        let mut sent_ids = Vec::new();

        for row in rows {
            if let Some(key) = &row.key {
                if blocked_keys.contains(key) {
                    report.deferred += 1;
                    continue;
                }
            }

            match self.send(&row).await {
                Ok(()) => {
                    report.sent += 1;
                    if row.state == OutboxState::Pending {
                        sent_ids.push(row.message_id.clone());
                    }
                }
                Err(err) if row.state == OutboxState::Failed => {
                    report.failed += 1;
                    tracing::error!(
                        message_id = %row.message_id,
                        error = %err,
                        "compensation publish failed"
                    );
                }
                Err(err) => {
                    report.failed += 1;
                    if let Some(key) = &row.key {
                        blocked_keys.insert(key.clone());
                    }
                    self.reschedule(&row, &err).await;
                }
            }
        }

        if !sent_ids.is_empty() {
            if let Err(err) = self.store.mark_sent(&sent_ids).await {
                // Rows stay Pending and will be sent again; consumers dedupe.
                tracing::warn!(error = %err, count = sent_ids.len(), "failed to mark rows sent");
            }
        }

        report
    }

    async fn send(&self, row: &StagedMessage) -> Result<()> {
        let envelope = row.to_envelope()?;
        let record = Record::from_envelope(&envelope)?;
        self.transport.publish(record).await?;
        Ok(())
    }

    async fn reschedule(&self, row: &StagedMessage, err: &Error) {
        let delay = self.retry.retry_delay(row.attempts + 1);
        let next_attempt_at = SystemTime::now() + delay;
        tracing::warn!(
            message_id = %row.message_id,
            attempts = row.attempts + 1,
            retry_in = ?delay,
            error = %err,
            "publish failed, row stays pending"
        );
        if let Err(store_err) = self
            .store
            .record_failure(&row.message_id, &err.to_string(), next_attempt_at)
            .await
        {
            tracing::warn!(message_id = %row.message_id, error = %store_err, "failed to record publish failure");
        }
    }
}

impl std::fmt::Debug for OutboxPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxPublisher")
            .field("outstanding", &self.outstanding())
            .finish()
    }
}
