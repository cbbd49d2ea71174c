//! Consumer groups: partition readers feeding the mailbox.
//!
//! ```text
//!  Subscriber ──fetch(p, offset)──▶ PartitionReader ──enqueue(key)──▶ Mailbox
//!      ▲                               │     ▲                          │
//!      │                               │     └──── completion (p, off) ─┘
//!      └──── commit(lowest in-flight) ─┘
//! ```
//!
//! A reader stops fetching while the mailbox is full and backs off when its
//! partitions are idle. Offsets are committed only up to the lowest entry
//! still running, so a crash redelivers at most the uncommitted tail.
//! Handlers should be idempotent; [`HandlerRegistry::with_processed_log`]
//! drops redeliveries by `MessageId`.

mod backoff;
mod group;
mod handler;
mod offsets;
mod reader;

pub use backoff::Backoff;
pub use group::{ConsumerGroup, ConsumerHandle};
pub use handler::{HandleOutcome, HandlerRegistry, InMemoryProcessedLog, ProcessedMessageLog};
pub use offsets::OffsetTracker;
pub use reader::{ConsumerStats, DEAD_LETTER_REASON};
