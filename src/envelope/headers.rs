use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::codec::PayloadCodec;

pub const MESSAGE_ID: &str = "MessageID";
pub const CORRELATION_ID: &str = "CorrelationID";
pub const KEY: &str = "Key";
pub const TOPIC: &str = "Topic";
pub const SENT_TIME: &str = "SentTime";
pub const REPLY_TO: &str = "ReplyToEndPoint";
pub const SAGA_INFO: &str = "SagaInfo";
pub const PRODUCER: &str = "Producer";
pub const IP: &str = "IP";
pub const MESSAGE_TYPE: &str = "MessageType";
pub const CONTENT_TYPE: &str = "ContentType";

/// Correlates messages belonging to one long-running process.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaInfo {
    pub saga_id: String,
    /// Step (reply endpoint) that started the saga.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_endpoint: Option<String>,
}

impl SagaInfo {
    pub fn new(saga_id: impl Into<String>) -> Self {
        Self {
            saga_id: saga_id.into(),
            reply_endpoint: None,
        }
    }

    pub fn with_reply_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.reply_endpoint = Some(endpoint.into());
        self
    }
}

/// Where a consumed message was read from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Position {
    pub broker: String,
    pub partition: u32,
    pub offset: u64,
}

/// Well-known envelope headers plus an open extension map.
///
/// Unknown header names land in `extensions` so they survive a
/// decode/encode cycle untouched.
#[derive(Clone, Debug, PartialEq)]
pub struct Headers {
    pub message_id: String,
    pub correlation_id: Option<String>,
    pub key: Option<String>,
    pub topic: Option<String>,
    pub sent_time: SystemTime,
    pub reply_to: Option<String>,
    pub saga: Option<SagaInfo>,
    pub producer: Option<String>,
    pub ip: Option<String>,
    pub payload_type: Option<String>,
    pub codec: PayloadCodec,
    pub extensions: BTreeMap<String, String>,
}

impl Headers {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            correlation_id: None,
            key: None,
            topic: None,
            sent_time: SystemTime::now(),
            reply_to: None,
            saga: None,
            producer: None,
            ip: None,
            payload_type: None,
            codec: PayloadCodec::default(),
            extensions: BTreeMap::new(),
        }
    }

    /// Read any header by name, well-known or not.
    pub fn get(&self, name: &str) -> Option<String> {
        match name {
            MESSAGE_ID => Some(self.message_id.clone()),
            CORRELATION_ID => self.correlation_id.clone(),
            KEY => self.key.clone(),
            TOPIC => self.topic.clone(),
            SENT_TIME => Some(millis_since_epoch(self.sent_time).to_string()),
            REPLY_TO => self.reply_to.clone(),
            SAGA_INFO => self
                .saga
                .as_ref()
                .and_then(|saga| serde_json::to_string(saga).ok()),
            PRODUCER => self.producer.clone(),
            IP => self.ip.clone(),
            MESSAGE_TYPE => self.payload_type.clone(),
            CONTENT_TYPE => Some(self.codec.as_str().to_string()),
            other => self.extensions.get(other).cloned(),
        }
    }

    /// Write any header by name. Well-known names are parsed into their
    /// typed field; a value that fails to parse is kept as an extension.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match name.as_str() {
            MESSAGE_ID => self.message_id = value,
            CORRELATION_ID => self.correlation_id = Some(value),
            KEY => self.key = Some(value),
            TOPIC => self.topic = Some(value),
            SENT_TIME => match value.parse::<u64>() {
                Ok(ms) => self.sent_time = UNIX_EPOCH + Duration::from_millis(ms),
                Err(_) => {
                    self.extensions.insert(name, value);
                }
            },
            REPLY_TO => self.reply_to = Some(value),
            SAGA_INFO => match serde_json::from_str::<SagaInfo>(&value) {
                Ok(saga) => self.saga = Some(saga),
                Err(_) => {
                    self.extensions.insert(name, value);
                }
            },
            PRODUCER => self.producer = Some(value),
            IP => self.ip = Some(value),
            MESSAGE_TYPE => self.payload_type = Some(value),
            CONTENT_TYPE => match PayloadCodec::parse(&value) {
                Some(codec) => self.codec = codec,
                None => {
                    self.extensions.insert(name, value);
                }
            },
            _ => {
                self.extensions.insert(name, value);
            }
        }
    }

    /// Flatten into the string map carried on the wire.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = self.extensions.clone();
        for name in [
            MESSAGE_ID,
            CORRELATION_ID,
            KEY,
            TOPIC,
            SENT_TIME,
            REPLY_TO,
            SAGA_INFO,
            PRODUCER,
            IP,
            MESSAGE_TYPE,
            CONTENT_TYPE,
        ] {
            if let Some(value) = self.get(name) {
                map.insert(name.to_string(), value);
            }
        }
        map
    }

    /// Rebuild from a wire map. Returns `None` without a `MessageID`.
    pub fn from_map(map: BTreeMap<String, String>) -> Option<Self> {
        let message_id = map.get(MESSAGE_ID)?.clone();
        let mut headers = Headers::new(message_id);
        headers.sent_time = UNIX_EPOCH;
        for (name, value) in map {
            if name != MESSAGE_ID {
                headers.set(name, value);
            }
        }
        Some(headers)
    }
}

pub(crate) fn millis_since_epoch(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
