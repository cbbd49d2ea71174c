//! Consumer group integration tests.
//!
//! Every test runs a real `ConsumerGroup` against `InMemoryBroker` and
//! observes handler effects, broker offsets, and the dead-letter topic.

mod support;
mod ordering;
mod backpressure;
mod redelivery;
mod dead_letter;
mod host;
