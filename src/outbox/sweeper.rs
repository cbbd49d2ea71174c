//! Background retry of `Pending` outbox rows.

use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::publisher::{OutboxPublisher, PublishReport};
use super::store::OutboxStore;
use crate::config::OutboxConfig;
use crate::error::Result;

/// Counters accumulated by a running sweeper.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub sweeps: usize,
    pub published: usize,
    pub failed: usize,
    pub store_errors: usize,
}

/// Re-publishes rows the post-commit send did not deliver.
///
/// Every `sweep_interval` it loads up to `sweep_batch_size` due rows older
/// than `sweep_min_age` and publishes them. Failures back off exponentially
/// from `retry_base` up to `retry_cap`; rows are never given up on.
#[derive(Clone)]
pub struct OutboxSweeper {
    store: Arc<dyn OutboxStore>,
    publisher: OutboxPublisher,
    config: OutboxConfig,
}

impl OutboxSweeper {
    pub fn new(publisher: OutboxPublisher, config: OutboxConfig) -> Self {
        Self {
            store: Arc::clone(publisher.store()),
            publisher,
            config,
        }
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Run a single sweep.
    pub async fn sweep_once(&self) -> Result<PublishReport> {
        let now = SystemTime::now();
        let cutoff = now
            .checked_sub(self.config.sweep_min_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let rows: Vec<_> = self
            .store
            .pending_due(now, self.config.sweep_batch_size)
            .await?
            .into_iter()
            .filter(|row| row.created_at <= cutoff)
            .collect();

        if rows.is_empty() {
            return Ok(PublishReport::default());
        }

        tracing::debug!(rows = rows.len(), "sweeping pending outbox rows");
        Ok(self.publisher.publish_now(rows).await)
    }

    /// Sweep on a timer until `stop` is signalled.
    pub fn spawn(self) -> SweeperHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut stats = SweepStats::default();
            let mut ticker = tokio::time::interval(self.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        stats.sweeps += 1;
                        match self.sweep_once().await {
                            Ok(report) => {
                                stats.published += report.sent;
                                stats.failed += report.failed;
                            }
                            Err(err) => {
                                stats.store_errors += 1;
                                tracing::warn!(error = %err, "outbox sweep failed");
                            }
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            stats
        });

        SweeperHandle { stop_tx, handle }
    }
}

/// Stop handle for a spawned sweeper.
pub struct SweeperHandle {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<SweepStats>,
}

impl SweeperHandle {
    pub fn signal_stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Signal stop and wait for the current sweep to finish.
    pub async fn stop(self) -> SweepStats {
        self.signal_stop();
        self.join().await
    }

    pub async fn join(self) -> SweepStats {
        match self.handle.await {
            Ok(stats) => stats,
            Err(err) => {
                tracing::error!(error = %err, "outbox sweeper task failed");
                SweepStats::default()
            }
        }
    }
}
