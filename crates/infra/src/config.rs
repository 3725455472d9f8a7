//! Per-module messaging configuration.
//!
//! Every module runs two processors (outbox and inbox), each configured
//! independently. Values come from the environment:
//!
//! | Key | Default |
//! |-----|---------|
//! | `COURIER_<MODULE>_<OUTBOX\|INBOX>_ENABLED` | `true` |
//! | `COURIER_<MODULE>_<OUTBOX\|INBOX>_POLL_INTERVAL_MS` | `5000` |
//! | `COURIER_<MODULE>_<OUTBOX\|INBOX>_BATCH_SIZE` | `20` |
//! | `COURIER_<MODULE>_<OUTBOX\|INBOX>_MAX_ATTEMPTS` | `5` |
//! | `COURIER_<MODULE>_<OUTBOX\|INBOX>_HANDLER_TIMEOUT_MS` | `30000` |

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use courier_core::ModuleName;

use crate::store::MessageKind;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("invalid processor configuration: {0}")]
    Invalid(String),
}

/// Processor settings for one message table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    pub enabled: bool,
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// Failed attempts after which a message is marked permanently failed.
    pub max_attempts: u32,
    /// Upper bound for a single consumer invocation; exceeding it is a transient failure.
    #[serde(with = "millis")]
    pub handler_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(5),
            batch_size: 20,
            max_attempts: 5,
            handler_timeout: Duration::from_secs(30),
        }
    }
}

impl ProcessorConfig {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be greater than zero".into()));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be greater than zero".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll_interval must be non-zero".into()));
        }
        if self.handler_timeout.is_zero() {
            return Err(ConfigError::Invalid("handler_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Outbox + inbox processor settings of one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleMessagingConfig {
    pub module: ModuleName,
    pub outbox: ProcessorConfig,
    pub inbox: ProcessorConfig,
}

impl ModuleMessagingConfig {
    pub fn new(module: ModuleName) -> Self {
        Self {
            module,
            outbox: ProcessorConfig::default(),
            inbox: ProcessorConfig::default(),
        }
    }

    /// Load from process environment variables.
    pub fn from_env(module: ModuleName) -> Result<Self, ConfigError> {
        Self::from_lookup(module, |key| std::env::var(key).ok())
    }

    /// Load through an arbitrary key lookup. Missing keys keep their defaults.
    pub fn from_lookup<F>(module: ModuleName, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let outbox = load_processor(&module, MessageKind::Outbox, &lookup)?;
        let inbox = load_processor(&module, MessageKind::Inbox, &lookup)?;
        Ok(Self { module, outbox, inbox })
    }

    pub fn processor(&self, kind: MessageKind) -> &ProcessorConfig {
        match kind {
            MessageKind::Outbox => &self.outbox,
            MessageKind::Inbox => &self.inbox,
        }
    }
}

fn env_prefix(module: &ModuleName, kind: MessageKind) -> String {
    format!(
        "COURIER_{}_{}",
        module.as_str().to_ascii_uppercase(),
        kind.as_str().to_ascii_uppercase()
    )
}

fn load_processor<F>(module: &ModuleName, kind: MessageKind, lookup: &F) -> Result<ProcessorConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let prefix = env_prefix(module, kind);
    let mut config = ProcessorConfig::default();

    if let Some(v) = read(&prefix, "ENABLED", lookup, parse_bool)? {
        config.enabled = v;
    }
    if let Some(ms) = read(&prefix, "POLL_INTERVAL_MS", lookup, |s| s.parse::<u64>().map_err(|e| e.to_string()))? {
        config.poll_interval = Duration::from_millis(ms);
    }
    if let Some(v) = read(&prefix, "BATCH_SIZE", lookup, |s| s.parse::<usize>().map_err(|e| e.to_string()))? {
        config.batch_size = v;
    }
    if let Some(v) = read(&prefix, "MAX_ATTEMPTS", lookup, |s| s.parse::<u32>().map_err(|e| e.to_string()))? {
        config.max_attempts = v;
    }
    if let Some(ms) = read(&prefix, "HANDLER_TIMEOUT_MS", lookup, |s| s.parse::<u64>().map_err(|e| e.to_string()))? {
        config.handler_timeout = Duration::from_millis(ms);
    }

    config.validate()?;
    Ok(config)
}

fn read<T, F, P>(prefix: &str, suffix: &str, lookup: &F, parse: P) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    P: Fn(&str) -> Result<T, String>,
{
    let key = format!("{prefix}_{suffix}");
    match lookup(&key) {
        None => Ok(None),
        Some(raw) => parse(raw.trim()).map(Some).map_err(|reason| ConfigError::InvalidValue {
            key,
            value: raw,
            reason,
        }),
    }
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(format!("expected a boolean, got '{other}'")),
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
