use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::envelope::codec::payload_base64;
use crate::envelope::headers::SAGA_INFO;
use crate::envelope::{Envelope, Headers, PayloadCodec};
use crate::error::{Error, Result};

/// Lifecycle of an outbox row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutboxState {
    /// Committed, not yet acknowledged by the broker.
    Pending,
    /// Acknowledged by the broker. Kept as an archive.
    Sent,
    /// Compensation record written when a unit of work failed.
    Failed,
}

/// One envelope staged for publication.
///
/// Routing columns are broken out for querying; `headers` keeps the full
/// header map so the envelope is rebuilt exactly, `MessageId` included.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StagedMessage {
    pub message_id: String,
    pub correlation_id: Option<String>,
    pub key: Option<String>,
    pub topic: Option<String>,
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
    pub payload_type: Option<String>,
    pub codec: PayloadCodec,
    /// Serialized `SagaInfo`.
    pub saga_info: Option<String>,
    pub reply_to: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub created_at: SystemTime,
    pub state: OutboxState,
    pub failure_reason: Option<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: SystemTime,
}

impl StagedMessage {
    pub fn pending(envelope: &Envelope) -> Self {
        let now = SystemTime::now();
        let headers = envelope.headers();
        Self {
            message_id: envelope.message_id().to_string(),
            correlation_id: headers.correlation_id.clone(),
            key: headers.key.clone(),
            topic: headers.topic.clone(),
            payload: envelope.payload().to_vec(),
            payload_type: headers.payload_type.clone(),
            codec: headers.codec,
            saga_info: headers.get(SAGA_INFO),
            reply_to: headers.reply_to.clone(),
            headers: headers.to_map(),
            created_at: now,
            state: OutboxState::Pending,
            failure_reason: None,
            attempts: 0,
            last_error: None,
            next_attempt_at: now,
        }
    }

    /// Compensation record carrying the error that aborted the unit of work.
    pub fn failed(envelope: &Envelope, reason: impl Into<String>) -> Self {
        Self {
            state: OutboxState::Failed,
            failure_reason: Some(reason.into()),
            ..Self::pending(envelope)
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope> {
        let headers = Headers::from_map(self.headers.clone()).ok_or_else(|| {
            Error::deserialization(
                self.payload_type.as_deref().unwrap_or("<unknown>"),
                format!("outbox row {} has no message id header", self.message_id),
            )
        })?;
        Ok(Envelope::from_parts(headers, self.payload.clone()))
    }

    pub fn is_pending(&self) -> bool {
        self.state == OutboxState::Pending
    }

    /// Pending and past its retry time.
    pub fn is_due(&self, now: SystemTime) -> bool {
        self.is_pending() && self.next_attempt_at <= now
    }

    pub(crate) fn mark_sent(&mut self) {
        if self.is_pending() {
            self.state = OutboxState::Sent;
            self.last_error = None;
        }
    }

    pub(crate) fn record_failure(&mut self, error: &str, next_attempt_at: SystemTime) {
        self.attempts += 1;
        self.last_error = Some(error.to_string());
        self.next_attempt_at = next_attempt_at;
    }
}
