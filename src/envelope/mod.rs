//! Envelopes: the unit every other component moves around.
//!
//! ```text
//! ┌──────────────────────── Envelope ────────────────────────┐
//! │ Headers                                                  │
//! │   MessageID  CorrelationID  Key  Topic  SentTime         │
//! │   ReplyToEndPoint  SagaInfo  Producer  IP                │
//! │   MessageType  ContentType  + extensions                 │
//! ├──────────────────────────────────────────────────────────┤
//! │ Payload bytes (json / bitcode), decoded lazily           │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! On the wire an envelope is a JSON object `{ "headers": {..}, "payload": "<base64>" }`.

pub(crate) mod codec;
#[allow(clippy::module_inception)]
mod envelope;
pub mod headers;
mod message;
mod registry;

pub use codec::PayloadCodec;
pub use envelope::{new_message_id, Envelope};
pub use headers::{Headers, Position, SagaInfo};
pub use message::Message;
pub use registry::{AnyPayload, TypeRegistry};
