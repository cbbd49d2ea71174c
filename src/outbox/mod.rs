//! Transactional outbox.
//!
//! ```text
//!  UnitOfWork ──stage()──▶ StoreTransaction ──commit()──▶ outbox rows (Pending)
//!                                                             │
//!            ┌─────────── dispatch() right after commit ──────┤
//!            │                                                │
//!            ▼                                                ▼
//!     OutboxPublisher ◀──────── OutboxSweeper (timer) ── pending_due()
//!            │
//!            ▼
//!     bus::Publisher ── ack ──▶ mark_sent()      fail ──▶ record_failure()
//! ```
//!
//! Business writes and outbox rows commit in one transaction, so a
//! committed change always has its messages staged. Sends happen after
//! commit and a send failure never undoes the commit.

mod in_memory;
mod message;
mod publisher;
mod store;
mod sweeper;

pub use in_memory::{InMemoryStore, InMemoryTransaction};
pub use message::{OutboxState, StagedMessage};
pub use publisher::{OutboxPublisher, PublishReport};
pub use store::{
    Document, IsolationLevel, OutboxStore, StoreTransaction, TransactionOptions,
    TransactionScope, TransactionalStore,
};
pub use sweeper::{OutboxSweeper, SweepStats, SweeperHandle};
