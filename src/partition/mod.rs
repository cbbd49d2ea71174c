//! Partition key resolution: which ordered lane a message belongs to.

mod resolver;

pub use resolver::{KeyFallback, PartitionKeyResolver};
