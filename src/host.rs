//! Lifecycle owner for every background task the bus runs.
//!
//! ```text
//!   MessagingHost::builder()
//!       .consumer_group(..)      ─┐
//!       .outbox(publisher, cfg)  ─┼─▶ build() ─▶ start() ─▶ shutdown(timeout)
//!                                 │                           │
//!                                 │     stop readers, stop sweeper, drain publisher
//!                                 │                           │
//!                                 └──────────── HostReport | Error::ShutdownTimeout
//! ```

use std::time::Duration;

use tokio::time::Instant;

use crate::config::OutboxConfig;
use crate::consumer::{ConsumerGroup, ConsumerHandle, ConsumerStats};
use crate::error::{Error, Result};
use crate::outbox::{OutboxPublisher, OutboxSweeper, SweepStats, SweeperHandle};

/// What the host's tasks did before shutdown.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HostReport {
    pub consumers: ConsumerStats,
    pub sweeps: SweepStats,
}

#[derive(Default)]
pub struct MessagingHostBuilder {
    groups: Vec<ConsumerGroup>,
    publisher: Option<OutboxPublisher>,
    sweeper: Option<OutboxSweeper>,
}

impl MessagingHostBuilder {
    pub fn consumer_group(mut self, group: ConsumerGroup) -> Self {
        self.groups.push(group);
        self
    }

    /// Drain this publisher's in-flight sends on shutdown.
    pub fn publisher(mut self, publisher: OutboxPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Drain `publisher` on shutdown and run a sweeper for it.
    pub fn outbox(mut self, publisher: OutboxPublisher, config: OutboxConfig) -> Self {
        self.sweeper = Some(OutboxSweeper::new(publisher.clone(), config));
        self.publisher = Some(publisher);
        self
    }

    pub fn build(self) -> MessagingHost {
        MessagingHost {
            groups: self.groups,
            publisher: self.publisher,
            sweeper: self.sweeper,
            consumers: Vec::new(),
            sweeper_handle: None,
            started: false,
        }
    }
}

/// Owns consumer groups, the outbox sweeper, and the publisher.
///
/// Built once, started once, shut down with a time bound. A shutdown that
/// overruns the bound is reported as [`Error::ShutdownTimeout`].
pub struct MessagingHost {
    groups: Vec<ConsumerGroup>,
    publisher: Option<OutboxPublisher>,
    sweeper: Option<OutboxSweeper>,
    consumers: Vec<ConsumerHandle>,
    sweeper_handle: Option<SweeperHandle>,
    started: bool,
}

impl MessagingHost {
    pub fn builder() -> MessagingHostBuilder {
        MessagingHostBuilder::default()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn consumers(&self) -> &[ConsumerHandle] {
        &self.consumers
    }

    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::Validation("messaging host already started".into()));
        }
        self.started = true;

        for group in std::mem::take(&mut self.groups) {
            match group.start().await {
                Ok(handle) => self.consumers.push(handle),
                Err(err) => {
                    // Leave nothing running behind a failed start.
                    for handle in self.consumers.drain(..) {
                        handle.stop().await;
                    }
                    return Err(err);
                }
            }
        }
        if let Some(sweeper) = self.sweeper.take() {
            self.sweeper_handle = Some(sweeper.spawn());
        }

        tracing::info!(
            consumer_groups = self.consumers.len(),
            sweeper = self.sweeper_handle.is_some(),
            "messaging host started"
        );
        Ok(())
    }

    /// Stop everything and wait at most `timeout` for it to finish.
    pub async fn shutdown(self, timeout: Duration) -> Result<HostReport> {
        let deadline = Instant::now() + timeout;

        for consumer in &self.consumers {
            consumer.signal_stop();
        }
        if let Some(sweeper) = &self.sweeper_handle {
            sweeper.signal_stop();
        }

        let MessagingHost {
            consumers,
            sweeper_handle,
            publisher,
            ..
        } = self;

        let wind_down = async move {
            let mut report = HostReport::default();
            for consumer in consumers {
                report.consumers += consumer.join().await;
            }
            if let Some(sweeper) = sweeper_handle {
                report.sweeps = sweeper.join().await;
            }
            if let Some(publisher) = publisher {
                publisher
                    .drain(deadline.saturating_duration_since(Instant::now()))
                    .await?;
            }
            Ok::<_, Error>(report)
        };

        match tokio::time::timeout_at(deadline, wind_down).await {
            Ok(Ok(report)) => {
                tracing::info!(?report, "messaging host stopped");
                Ok(report)
            }
            Ok(Err(_)) | Err(_) => {
                tracing::error!(?timeout, "messaging host did not stop in time");
                Err(Error::ShutdownTimeout(timeout))
            }
        }
    }
}
