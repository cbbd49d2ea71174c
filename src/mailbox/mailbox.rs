use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch, Semaphore};

use crate::config::ConsumerConfig;
use crate::error::MailboxError;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Mailbox sizing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    /// Keys that may execute at the same time.
    pub concurrency: usize,
    /// Entries drained from one key before its worker yields.
    pub batch_count: usize,
    /// Queued plus running entries at which the mailbox reports full.
    pub full_load_threshold: usize,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            concurrency: 64,
            batch_count: 100,
            full_load_threshold: 1000,
        }
    }
}

impl From<&ConsumerConfig> for MailboxConfig {
    fn from(config: &ConsumerConfig) -> Self {
        Self {
            concurrency: config.mailbox_concurrency,
            batch_count: config.mailbox_process_batch_count,
            full_load_threshold: config.full_load_threshold,
        }
    }
}

struct Shared {
    /// Queue per key. A key is present exactly while an activation for it is
    /// scheduled or running.
    queues: Mutex<HashMap<String, VecDeque<Job>>>,
    permits: Arc<Semaphore>,
    in_flight: watch::Sender<usize>,
    batch_count: usize,
    full_load_threshold: usize,
}

/// Per-key FIFO executor multiplexed over a bounded pool of tokio tasks.
///
/// Entries for one key run one at a time in enqueue order. Entries for
/// different keys run concurrently, up to `concurrency` keys at once. A key
/// whose queue empties is retired; enqueuing to it again starts a fresh
/// queue.
///
/// The mailbox never drops work for being over `full_load_threshold`; it
/// only reports fullness so producers can stop pulling.
///
/// Must be used from within a tokio runtime.
#[derive(Clone)]
pub struct Mailbox {
    shared: Arc<Shared>,
}

impl Mailbox {
    pub fn new(config: MailboxConfig) -> Self {
        let (in_flight, _) = watch::channel(0usize);
        Self {
            shared: Arc::new(Shared {
                queues: Mutex::new(HashMap::new()),
                permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
                in_flight,
                batch_count: config.batch_count.max(1),
                full_load_threshold: config.full_load_threshold.max(1),
            }),
        }
    }

    /// Queue `task` behind every earlier entry for `key`.
    ///
    /// The returned [`Completion`] resolves with the task's output once it has
    /// run. A panicking task resolves its completion with
    /// [`MailboxError::TaskPanicked`] and does not affect later entries.
    pub fn enqueue<F, T>(
        &self,
        key: impl Into<String>,
        task: F,
    ) -> Result<Completion<T>, MailboxError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.push(key.into(), task, true)
    }

    /// Claim up to `wanted` slots below the full-load threshold.
    ///
    /// Claimed slots count as in flight until they are used through
    /// [`Reservation::enqueue`] or the reservation is dropped, so producers
    /// sharing one mailbox cannot together overshoot the threshold.
    pub fn reserve(&self, wanted: usize) -> Reservation {
        let threshold = self.shared.full_load_threshold;
        let mut granted = 0;
        self.shared.in_flight.send_if_modified(|n| {
            granted = wanted.min(threshold.saturating_sub(*n));
            *n += granted;
            granted > 0
        });
        Reservation {
            mailbox: self.clone(),
            remaining: granted,
        }
    }

    fn push<F, T>(&self, key: String, task: F, counted: bool) -> Result<Completion<T>, MailboxError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if key.trim().is_empty() {
            return Err(MailboxError::InvalidKey);
        }

        let (tx, rx) = oneshot::channel();
        let panic_key = key.clone();
        let job: Job = Box::pin(async move {
            let outcome = AssertUnwindSafe(task)
                .catch_unwind()
                .await
                .map_err(|_| MailboxError::TaskPanicked(panic_key));
            // Caller may have dropped the completion handle.
            let _ = tx.send(outcome);
        });

        if counted {
            self.shared.in_flight.send_modify(|n| *n += 1);
        }

        let needs_activation = {
            let mut queues = self.shared.queues.lock();
            match queues.get_mut(&key) {
                Some(queue) => {
                    queue.push_back(job);
                    false
                }
                None => {
                    queues.insert(key.clone(), VecDeque::from([job]));
                    true
                }
            }
        };

        if needs_activation {
            activate(Arc::clone(&self.shared), key.clone());
        }

        Ok(Completion { key, rx })
    }

    /// Entries queued or running across all keys.
    pub fn in_flight(&self) -> usize {
        *self.shared.in_flight.borrow()
    }

    pub fn full_load_threshold(&self) -> usize {
        self.shared.full_load_threshold
    }

    pub fn is_full(&self) -> bool {
        self.in_flight() >= self.shared.full_load_threshold
    }

    /// Headroom before the mailbox reports full.
    pub fn capacity(&self) -> usize {
        self.shared
            .full_load_threshold
            .saturating_sub(self.in_flight())
    }

    /// Resolves once in-flight entries drop below the threshold.
    pub async fn wait_for_capacity(&self) {
        let threshold = self.shared.full_load_threshold;
        let mut rx = self.shared.in_flight.subscribe();
        let _ = rx.wait_for(|n| *n < threshold).await;
    }

    /// Resolves once every queued entry has finished.
    pub async fn wait_idle(&self) {
        let mut rx = self.shared.in_flight.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Keys that currently own a queue.
    pub fn active_keys(&self) -> usize {
        self.shared.queues.lock().len()
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("in_flight", &self.in_flight())
            .field("active_keys", &self.active_keys())
            .field("batch_count", &self.shared.batch_count)
            .field("full_load_threshold", &self.shared.full_load_threshold)
            .finish()
    }
}

/// Slots claimed with [`Mailbox::reserve`]. Unused slots are released on
/// drop.
#[must_use = "dropping a reservation releases its slots"]
pub struct Reservation {
    mailbox: Mailbox,
    remaining: usize,
}

impl Reservation {
    /// Slots not yet used.
    pub fn len(&self) -> usize {
        self.remaining
    }

    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    /// Like [`Mailbox::enqueue`], but uses a claimed slot. Once the slots
    /// run out, entries are counted as usual.
    pub fn enqueue<F, T>(
        &mut self,
        key: impl Into<String>,
        task: F,
    ) -> Result<Completion<T>, MailboxError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let reserved = self.remaining > 0;
        let completion = self.mailbox.push(key.into(), task, !reserved)?;
        if reserved {
            self.remaining -= 1;
        }
        Ok(completion)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.remaining > 0 {
            let unused = self.remaining;
            self.mailbox
                .shared
                .in_flight
                .send_modify(|n| *n = n.saturating_sub(unused));
        }
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("remaining", &self.remaining)
            .finish()
    }
}

/// Run up to `batch_count` entries for `key`, then retire the key or
/// schedule another activation behind whoever is waiting for a permit.
fn activate(shared: Arc<Shared>, key: String) {
    tokio::spawn(async move {
        let permit = match Arc::clone(&shared.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        for _ in 0..shared.batch_count {
            let job = shared
                .queues
                .lock()
                .get_mut(&key)
                .and_then(VecDeque::pop_front);
            let Some(job) = job else { break };
            job.await;
            shared.in_flight.send_modify(|n| *n = n.saturating_sub(1));
        }

        drop(permit);

        let more = {
            let mut queues = shared.queues.lock();
            match queues.get(&key) {
                Some(queue) if queue.is_empty() => {
                    queues.remove(&key);
                    false
                }
                Some(_) => true,
                None => false,
            }
        };

        if more {
            activate(shared, key);
        }
    });
}

/// Handle to one mailbox entry's result.
#[must_use = "a completion does nothing unless awaited"]
pub struct Completion<T> {
    key: String,
    rx: oneshot::Receiver<Result<T, MailboxError>>,
}

impl<T> Completion<T> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T, MailboxError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(MailboxError::Dropped(self.key.clone()))),
            Poll::Pending => Poll::Pending,
        }
    }
}
