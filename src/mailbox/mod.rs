//! Per-key sequential execution with bounded concurrency and backpressure.
//!
//! ```text
//!  enqueue(key, task)
//!        │
//!        ▼
//!  ┌───────────┐   ┌───────────┐   ┌───────────┐
//!  │ key "A1"  │   │ key "B2"  │   │ key "C3"  │   one FIFO per key
//!  │ t1 t2 t3  │   │ t1        │   │ t1 t2     │
//!  └─────┬─────┘   └─────┬─────┘   └─────┬─────┘
//!        └───────────────┼───────────────┘
//!                        ▼
//!          semaphore(concurrency) activations,
//!          each draining ≤ batch_count entries
//! ```

#[allow(clippy::module_inception)]
mod mailbox;

pub use mailbox::{Completion, Mailbox, MailboxConfig, Reservation};
