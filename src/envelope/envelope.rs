use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::codec::{payload_base64, PayloadCodec};
use super::headers::{Headers, Position, SagaInfo};
use super::message::Message;
use super::registry::{AnyPayload, TypeRegistry};
use crate::error::{Error, Result};

/// Self-describing message: headers plus a serialized payload.
///
/// Envelopes are immutable by convention. Builders that change routing
/// (`rekey`, `reply_to`) return a copy carrying the same `MessageId` and
/// `CorrelationId`, so consumers can use the id as an idempotency token.
#[derive(Clone)]
pub struct Envelope {
    headers: Headers,
    payload: Vec<u8>,
    position: Option<Position>,
    decoded: OnceLock<AnyPayload>,
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    headers: BTreeMap<String, String>,
    #[serde(with = "payload_base64")]
    payload: Vec<u8>,
}

pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

impl Envelope {
    /// Wrap a message, encoding its payload as JSON.
    pub fn new<M: Message>(message: &M) -> Result<Self> {
        Self::with_codec(message, PayloadCodec::Json)
    }

    /// Wrap a message under an explicit id.
    pub fn with_id<M: Message>(message: &M, id: impl Into<String>) -> Result<Self> {
        let mut envelope = Self::new(message)?;
        envelope.headers.message_id = id.into();
        Ok(envelope)
    }

    pub fn with_codec<M: Message>(message: &M, codec: PayloadCodec) -> Result<Self> {
        let payload = codec.encode(message).map_err(|reason| {
            Error::Validation(format!("cannot serialize {}: {}", M::TYPE_NAME, reason))
        })?;

        let mut headers = Headers::new(message.message_id().unwrap_or_else(new_message_id));
        headers.topic = message.topic();
        headers.key = message.partition_key();
        headers.payload_type = Some(M::TYPE_NAME.to_string());
        headers.codec = codec;

        Ok(Self::from_parts(headers, payload))
    }

    pub fn from_parts(headers: Headers, payload: Vec<u8>) -> Self {
        Self {
            headers,
            payload,
            position: None,
            decoded: OnceLock::new(),
        }
    }

    /// Rebuild an envelope from its wire form. The payload is not decoded.
    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        let wire: WireEnvelope = serde_json::from_slice(bytes)
            .map_err(|e| Error::deserialization("Envelope", e))?;
        let headers = Headers::from_map(wire.headers)
            .ok_or_else(|| Error::deserialization("Envelope", "missing MessageID header"))?;
        Ok(Self::from_parts(headers, wire.payload))
    }

    pub fn to_wire(&self) -> Result<Vec<u8>> {
        let wire = WireEnvelope {
            headers: self.headers.to_map(),
            payload: self.payload.clone(),
        };
        serde_json::to_vec(&wire).map_err(|e| Error::Unknown(e.into()))
    }

    // -- Routing copies --

    /// Copy with a new partition key.
    pub fn rekey(&self, key: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.headers.key = Some(key.into());
        copy
    }

    /// Copy with a reply target for request/reply.
    pub fn reply_to(&self, endpoint: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.headers.reply_to = Some(endpoint.into());
        copy
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.headers.topic = Some(topic.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.headers.correlation_id = Some(id.into());
        self
    }

    pub fn with_saga(mut self, saga: SagaInfo) -> Self {
        self.headers.saga = Some(saga);
        self
    }

    pub fn with_provenance(mut self, producer: impl Into<String>, ip: impl Into<String>) -> Self {
        self.headers.producer = Some(producer.into());
        self.headers.ip = Some(ip.into());
        self
    }

    /// Correlate with the message that caused this one.
    pub fn caused_by(mut self, parent: &Envelope) -> Self {
        self.headers.correlation_id = Some(parent.message_id().to_string());
        if self.headers.saga.is_none() {
            self.headers.saga = parent.headers.saga.clone();
        }
        self
    }

    pub fn at_position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    /// Set any header by name. Clears the memoized payload.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.set(name, value);
        self.decoded = OnceLock::new();
    }

    // -- Accessors --

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.headers.get(name)
    }

    pub fn message_id(&self) -> &str {
        &self.headers.message_id
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.headers.correlation_id.as_deref()
    }

    pub fn key(&self) -> Option<&str> {
        self.headers.key.as_deref()
    }

    pub fn topic(&self) -> Option<&str> {
        self.headers.topic.as_deref()
    }

    pub fn sent_time(&self) -> SystemTime {
        self.headers.sent_time
    }

    pub fn reply_endpoint(&self) -> Option<&str> {
        self.headers.reply_to.as_deref()
    }

    pub fn saga(&self) -> Option<&SagaInfo> {
        self.headers.saga.as_ref()
    }

    pub fn producer(&self) -> Option<&str> {
        self.headers.producer.as_deref()
    }

    pub fn ip(&self) -> Option<&str> {
        self.headers.ip.as_deref()
    }

    pub fn payload_type(&self) -> Option<&str> {
        self.headers.payload_type.as_deref()
    }

    pub fn codec(&self) -> PayloadCodec {
        self.headers.codec
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    // -- Payload access --

    /// Decode the payload as a known type.
    pub fn decode<M: Message>(&self) -> Result<M> {
        if let Some(carried) = self.payload_type() {
            if carried != M::TYPE_NAME {
                return Err(Error::deserialization(
                    carried,
                    format!("payload is not a {}", M::TYPE_NAME),
                ));
            }
        }
        self.headers
            .codec
            .decode(&self.payload)
            .map_err(|reason| Error::deserialization(M::TYPE_NAME, reason))
    }

    /// Decode the payload using the carried type name, on first access.
    ///
    /// Successful decodes are memoized; failures are not, so a later call
    /// with a fuller registry can still succeed.
    pub fn materialize(&self, registry: &TypeRegistry) -> Result<AnyPayload> {
        if let Some(value) = self.decoded.get() {
            return Ok(Arc::clone(value));
        }

        let type_name = self
            .payload_type()
            .ok_or_else(|| Error::deserialization("<unknown>", "missing MessageType header"))?;
        let value = registry
            .decode(type_name, &self.payload, self.headers.codec)
            .map_err(|reason| Error::deserialization(type_name, reason))?;

        Ok(Arc::clone(self.decoded.get_or_init(|| value)))
    }

    /// Materialize and downcast to `M`.
    pub fn payload_as<M: Message>(&self, registry: &TypeRegistry) -> Result<Arc<M>> {
        let value = self.materialize(registry)?;
        value
            .downcast::<M>()
            .map_err(|_| Error::deserialization(M::TYPE_NAME, "payload has a different type"))
    }

    pub fn is_materialized(&self) -> bool {
        self.decoded.get().is_some()
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("message_id", &self.headers.message_id)
            .field("type", &self.headers.payload_type)
            .field("topic", &self.headers.topic)
            .field("key", &self.headers.key)
            .field("payload_len", &self.payload.len())
            .field("position", &self.position)
            .finish()
    }
}
