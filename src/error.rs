use thiserror::Error;

use crate::envelope::Envelope;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure categories callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Validation,
    ConcurrencyConflict,
    Domain,
    Transport,
    Deserialization,
    Unknown,
}

/// Top-level error for units of work, envelopes, consumers and the host.
#[derive(Debug, Error)]
pub enum Error {
    /// Caller input rejected before any state change.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Optimistic version mismatch. Retry the whole unit of work.
    #[error("concurrency conflict on {id} (expected version {expected}, found {actual})")]
    ConcurrencyConflict {
        id: String,
        expected: u64,
        actual: u64,
    },

    /// Business rule violation with a stable error code.
    #[error(transparent)]
    Domain(#[from] DomainFailure),

    #[error(transparent)]
    Transport(#[from] BusError),

    #[error("cannot deserialize payload of type {type_name}: {reason}")]
    Deserialization { type_name: String, reason: String },

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Mailbox(#[from] MailboxError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("shutdown did not complete within {0:?}")]
    ShutdownTimeout(std::time::Duration),

    #[error(transparent)]
    Unknown(#[from] anyhow::Error),
}

impl Error {
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::Validation(_) | Error::Config(_) => FailureKind::Validation,
            Error::ConcurrencyConflict { .. } => FailureKind::ConcurrencyConflict,
            Error::Domain(_) => FailureKind::Domain,
            Error::Transport(_) => FailureKind::Transport,
            Error::Deserialization { .. } => FailureKind::Deserialization,
            Error::Store(_)
            | Error::Mailbox(_)
            | Error::ShutdownTimeout(_)
            | Error::Unknown(_) => {
                FailureKind::Unknown
            }
        }
    }

    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Error::ConcurrencyConflict { .. })
    }

    pub fn deserialization(type_name: impl Into<String>, reason: impl ToString) -> Self {
        Error::Deserialization {
            type_name: type_name.into(),
            reason: reason.to_string(),
        }
    }

    /// Notification event declared by a domain failure, if any.
    pub fn notification(&self) -> Option<&Envelope> {
        match self {
            Error::Domain(failure) => failure.notification.as_ref(),
            _ => None,
        }
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict {
                id,
                expected,
                actual,
            } => Error::ConcurrencyConflict {
                id,
                expected,
                actual,
            },
            other => Error::Store(other),
        }
    }
}

/// A business rule violation.
///
/// `notification` is the event observers should receive when this failure
/// rolls back a unit of work.
#[derive(Debug, Clone, Error)]
#[error("domain failure {code}: {message}")]
pub struct DomainFailure {
    pub code: i32,
    pub message: String,
    pub notification: Option<Envelope>,
}

impl DomainFailure {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            notification: None,
        }
    }

    /// Declare the event published when this failure aborts a unit of work.
    pub fn with_notification<M: crate::Message>(mut self, event: &M) -> Result<Self> {
        self.notification = Some(Envelope::new(event)?);
        Ok(self)
    }
}

/// Broker I/O failure.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("broker rejected message: {0}")]
    Rejected(String),
    #[error("unknown topic {0}")]
    UnknownTopic(String),
    #[error("partition {partition} out of range for topic {topic}")]
    UnknownPartition { topic: String, partition: u32 },
    #[error("operation timed out")]
    Timeout,
}

/// Storage engine failure.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("version conflict on {id} (expected {expected}, found {actual})")]
    Conflict {
        id: String,
        expected: u64,
        actual: u64,
    },
    #[error("staged message {0} not found")]
    MissingMessage(String),
    #[error("transaction already closed")]
    Closed,
    #[error("storage failure: {0}")]
    Backend(String),
}

/// Mailbox scheduling failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MailboxError {
    #[error("mailbox key cannot be empty or whitespace")]
    InvalidKey,
    #[error("task for key {0} panicked")]
    TaskPanicked(String),
    #[error("task for key {0} was dropped before completing")]
    Dropped(String),
}
