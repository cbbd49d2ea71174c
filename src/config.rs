//! Runtime configuration.
//!
//! Every field has a default, so a config file only names what it changes:
//!
//! ```toml
//! [consumer]
//! wait_interval_ms = 500
//! full_load_threshold = 200
//! dead_letter_topic = "orders.dlq"
//!
//! [consumer.extensions]
//! "fetch.min.bytes" = 1024
//!
//! [outbox]
//! sweep_interval_ms = 10000
//!
//! [exception]
//! debug = true
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameworkConfig {
    pub consumer: ConsumerConfig,
    pub outbox: OutboxConfig,
    pub exception: ExceptionConfig,
}

impl FrameworkConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<()> {
        self.consumer.validate()
    }
}

/// Where a group with no committed offset starts reading.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoOffsetReset {
    #[default]
    Earliest,
    Latest,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Idle sleep after an empty or failed read.
    #[serde(rename = "wait_interval_ms", with = "duration_ms")]
    pub wait_interval: Duration,
    /// Added to the idle sleep for each consecutive empty or failed read.
    #[serde(rename = "back_off_increment_ms", with = "duration_ms")]
    pub back_off_increment: Duration,
    /// Upper bound on the idle sleep.
    #[serde(rename = "max_wait_ms", with = "duration_ms")]
    pub max_wait: Duration,
    /// In-flight mailbox entries at which readers stop pulling.
    pub full_load_threshold: usize,
    /// Entries one key may run before yielding its worker.
    pub mailbox_process_batch_count: usize,
    pub mailbox_concurrency: usize,
    #[serde(rename = "offset_commit_interval_ms", with = "duration_ms")]
    pub offset_commit_interval: Duration,
    /// Most messages requested from the broker per read.
    pub poll_batch_size: usize,
    pub auto_offset_reset: AutoOffsetReset,
    pub dead_letter_topic: Option<String>,
    /// Transport-specific settings passed through untouched.
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            wait_interval: Duration::from_millis(1000),
            back_off_increment: Duration::from_millis(30),
            max_wait: Duration::from_secs(30),
            full_load_threshold: 1000,
            mailbox_process_batch_count: 100,
            mailbox_concurrency: 64,
            offset_commit_interval: Duration::from_millis(1000),
            poll_batch_size: 100,
            auto_offset_reset: AutoOffsetReset::Earliest,
            dead_letter_topic: None,
            extensions: BTreeMap::new(),
        }
    }
}

impl ConsumerConfig {
    pub fn extension(&self, key: &str) -> Option<&serde_json::Value> {
        self.extensions.get(key)
    }

    pub fn set_extension(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.extensions.insert(key.into(), value.into());
    }

    pub fn validate(&self) -> Result<()> {
        if self.full_load_threshold == 0 {
            return Err(Error::Config("full_load_threshold must be positive".into()));
        }
        if self.mailbox_process_batch_count == 0 {
            return Err(Error::Config(
                "mailbox_process_batch_count must be positive".into(),
            ));
        }
        if self.mailbox_concurrency == 0 {
            return Err(Error::Config("mailbox_concurrency must be positive".into()));
        }
        if self.poll_batch_size == 0 {
            return Err(Error::Config("poll_batch_size must be positive".into()));
        }
        if self.max_wait < self.wait_interval {
            return Err(Error::Config("max_wait must be at least wait_interval".into()));
        }
        Ok(())
    }
}

/// Background retry schedule for `Pending` outbox rows.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    #[serde(rename = "sweep_interval_ms", with = "duration_ms")]
    pub sweep_interval: Duration,
    pub sweep_batch_size: usize,
    /// Rows younger than this are left to the post-commit send.
    #[serde(rename = "sweep_min_age_ms", with = "duration_ms")]
    pub sweep_min_age: Duration,
    #[serde(rename = "retry_base_ms", with = "duration_ms")]
    pub retry_base: Duration,
    #[serde(rename = "retry_cap_ms", with = "duration_ms")]
    pub retry_cap: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            sweep_batch_size: 100,
            sweep_min_age: Duration::from_secs(2),
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(300),
        }
    }
}

impl OutboxConfig {
    /// Delay before the next attempt after `attempts` failed sends.
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.retry_base
            .checked_mul(1u32 << exponent)
            .map_or(self.retry_cap, |delay| delay.min(self.retry_cap))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExceptionConfig {
    /// Pass failure messages through to callers.
    pub debug: bool,
    pub unknown_message: String,
    /// Extra attempts after a concurrency conflict.
    pub retry_count: u32,
}

impl Default for ExceptionConfig {
    fn default() -> Self {
        Self {
            debug: false,
            unknown_message: "UnknownError".to_string(),
            retry_count: 50,
        }
    }
}

/// Serde adapter storing a `Duration` as whole milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
