//! Reliable messaging core for CQRS services.
//!
//! ```text
//!  command ─▶ UnitOfWork ─stage─▶ outbox rows ─▶ OutboxPublisher ─▶ broker
//!                 │                                                  │
//!           ExceptionManager                                   ConsumerGroup
//!                                                                    │
//!                                       PartitionKeyResolver ─▶ Mailbox (FIFO per key)
//! ```

extern crate self as reliable_bus;

pub mod bus;
pub mod config;
pub mod consumer;
pub mod envelope;
mod error;
pub mod exception;
pub mod host;
pub mod mailbox;
pub mod outbox;
pub mod partition;
pub mod uow;

pub use envelope::{Envelope, Message, SagaInfo, TypeRegistry};
pub use error::{
    BusError, DomainFailure, Error, FailureKind, MailboxError, Result, StoreError,
};
pub use exception::{ApiResult, ErrorCode, ExceptionManager};
pub use host::MessagingHost;
pub use mailbox::Mailbox;
pub use partition::{KeyFallback, PartitionKeyResolver};
pub use uow::{UnitOfWork, UnitOfWorkFactory};

// Derive for the `Message` trait.
pub use reliable_bus_macros::Message;
