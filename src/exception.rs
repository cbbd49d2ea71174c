//! Translation of internal failures into caller-facing results.
//!
//! ```text
//!   command ──▶ ExceptionManager::process_with_retry
//!                   │
//!                   ├─ Ok(value)                 ─▶ ApiResult { success: true, result }
//!                   ├─ ConcurrencyConflict       ─▶ run again (at most retry_count times)
//!                   ├─ Domain { code }           ─▶ ApiResult { error_code: code }      (debug log)
//!                   ├─ Validation                ─▶ ApiResult { error_code: VALIDATION } (debug log)
//!                   └─ anything else             ─▶ ApiResult { error_code: UNKNOWN }    (error log)
//! ```
//!
//! Messages are replaced by `unknown_message` unless `debug` is set, so
//! internals do not leak to callers.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::ExceptionConfig;
use crate::error::{Error, Result};

/// Stable result code. Domain failures carry their own positive codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    pub const NONE: ErrorCode = ErrorCode(0);
    pub const UNKNOWN: ErrorCode = ErrorCode(-1);
    pub const VALIDATION: ErrorCode = ErrorCode(-2);
}

impl From<i32> for ErrorCode {
    fn from(code: i32) -> Self {
        ErrorCode(code)
    }
}

/// Outcome returned across the service boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiResult<T> {
    pub success: bool,
    pub error_code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
}

impl<T> ApiResult<T> {
    pub fn ok(result: T) -> Self {
        Self {
            success: true,
            error_code: ErrorCode::NONE,
            message: None,
            result: Some(result),
        }
    }

    pub fn failure(error_code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_code,
            message: Some(message.into()),
            result: None,
        }
    }
}

type MessageFormatter = Arc<dyn Fn(&Error) -> String + Send + Sync>;

/// Uniform retry and translation boundary around command execution.
#[derive(Clone)]
pub struct ExceptionManager {
    config: ExceptionConfig,
    formatter: Option<MessageFormatter>,
}

impl Default for ExceptionManager {
    fn default() -> Self {
        Self::new(ExceptionConfig::default())
    }
}

impl ExceptionManager {
    pub fn new(config: ExceptionConfig) -> Self {
        Self {
            config,
            formatter: None,
        }
    }

    /// Replace the default (redacting) message text.
    pub fn with_message_formatter(
        mut self,
        formatter: impl Fn(&Error) -> String + Send + Sync + 'static,
    ) -> Self {
        self.formatter = Some(Arc::new(formatter));
        self
    }

    pub fn config(&self) -> &ExceptionConfig {
        &self.config
    }

    /// Run `f` once and translate its outcome.
    pub async fn process<T, F, Fut>(&self, f: F) -> ApiResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match f().await {
            Ok(value) => ApiResult::ok(value),
            Err(err) => self.translate(err),
        }
    }

    /// Run `f`, re-running it from scratch after each concurrency conflict,
    /// at most `retry_count` extra times. Other failures are not retried.
    pub async fn process_with_retry<T, F, Fut>(&self, mut f: F) -> ApiResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries_left = self.config.retry_count;
        loop {
            match f().await {
                Ok(value) => return ApiResult::ok(value),
                Err(err) if err.is_concurrency_conflict() && retries_left > 0 => {
                    retries_left -= 1;
                    tracing::debug!(
                        error = %err,
                        retries_left,
                        "retrying after concurrency conflict"
                    );
                }
                Err(err) => return self.translate(err),
            }
        }
    }

    /// Synchronous variant of [`process`](Self::process).
    pub fn process_blocking<T, F>(&self, f: F) -> ApiResult<T>
    where
        F: FnOnce() -> Result<T>,
    {
        match f() {
            Ok(value) => ApiResult::ok(value),
            Err(err) => self.translate(err),
        }
    }

    /// Map an error to a failed result, logging it at the level its kind
    /// deserves.
    pub fn translate<T>(&self, err: Error) -> ApiResult<T> {
        let code = match &err {
            Error::Domain(failure) => {
                tracing::debug!(code = failure.code, error = %err, "domain failure");
                ErrorCode(failure.code)
            }
            Error::Validation(_) => {
                tracing::debug!(error = %err, "validation failure");
                ErrorCode::VALIDATION
            }
            _ => {
                tracing::error!(error = %err, kind = ?err.kind(), "unhandled failure");
                ErrorCode::UNKNOWN
            }
        };
        ApiResult::failure(code, self.message_for(&err))
    }

    fn message_for(&self, err: &Error) -> String {
        if let Some(formatter) = &self.formatter {
            return formatter(err);
        }
        if !self.config.debug {
            return self.config.unknown_message.clone();
        }
        match err {
            Error::Domain(failure) => failure.message.clone(),
            other => other.to_string(),
        }
    }
}

impl std::fmt::Debug for ExceptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExceptionManager")
            .field("config", &self.config)
            .field("custom_formatter", &self.formatter.is_some())
            .finish()
    }
}
