//! Broker boundary.
//!
//! ```text
//! ┌──────────────────┐  Record(topic, key, wire bytes)  ┌──────────────────┐
//! │ OutboxPublisher  │ ───────────────────────────────▶ │    Publisher     │
//! └──────────────────┘                                  │  (partitioned,   │
//! ┌──────────────────┐  Delivery(partition, offset)     │   append-only)   │
//! │  ConsumerGroup   │ ◀─────────────────────────────── │    Subscriber    │
//! └──────────────────┘  commit(group, partition, off)   └──────────────────┘
//! ```
//!
//! [`InMemoryBroker`] implements both sides; real transports live outside
//! this crate.

mod in_memory;
mod transport;

pub use in_memory::InMemoryBroker;
pub use transport::{Delivery, Publisher, Record, Subscriber};
