//!
//! This module defines broker-wide configuration and the open-ended key-value
//! configuration attached to queues, topics, routings and operators.
//!
use crate::error::{BrokerError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Source topic of a routing.
pub const SRC_TOPIC: &str = "SRC_TOPIC";

/// Destination queue of a routing.
pub const DST_QUEUE: &str = "DST_QUEUE";

/// Per-queue override of the redelivery timeout, in milliseconds.
pub const DELIVERY_TIMEOUT_MS: &str = "DELIVERY_TIMEOUT_MS";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerConfig {
    /// Time a delivered message may stay unacknowledged before it is redelivered.
    pub delivery_timeout_ms: u64,

    /// Period of the reaper that returns expired in-flight messages to their queues.
    pub reap_interval_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            delivery_timeout_ms: 30_000,
            reap_interval_ms: 1_000,
        }
    }
}

impl BrokerConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: BrokerConfig = serde_json::from_str(json)
            .map_err(|e| BrokerError::InvalidConfig(format!("broker config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    fn validate(&self) -> Result<()> {
        if self.delivery_timeout_ms == 0 {
            return Err(BrokerError::InvalidConfig(
                "deliveryTimeoutMs must be positive".to_owned(),
            ));
        }
        if self.reap_interval_ms == 0 {
            return Err(BrokerError::InvalidConfig(
                "reapIntervalMs must be positive".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

/// Open-ended configuration mapping of string keys to JSON values.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct KeyValue {
    entries: BTreeMap<String, Value>,
}

impl KeyValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.entries.insert(key.to_owned(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the string stored under `key`.
    ///
    /// # Errors
    /// Raise BrokerError::InvalidConfig if the key is absent or does not hold a string.
    pub fn require_str(&self, key: &str) -> Result<&str> {
        match self.entries.get(key) {
            Some(Value::String(s)) => Ok(s.as_str()),
            Some(other) => Err(BrokerError::InvalidConfig(format!(
                "{} must be a string, got {}",
                key, other
            ))),
            None => Err(BrokerError::InvalidConfig(format!("{} is required", key))),
        }
    }

    /// Returns the unsigned integer stored under `key`, if any.
    pub fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Value::Number(n)) => n.as_u64().map(Some).ok_or_else(|| {
                BrokerError::InvalidConfig(format!("{} must be a non-negative integer", key))
            }),
            Some(Value::String(s)) => s.parse::<u64>().map(Some).map_err(|_e| {
                BrokerError::InvalidConfig(format!("{} must be a non-negative integer", key))
            }),
            Some(other) => Err(BrokerError::InvalidConfig(format!(
                "{} must be a non-negative integer, got {}",
                key, other
            ))),
        }
    }
}

/// Settings a queue derives from its key-value configuration.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub(crate) struct QueueConfig {
    pub(crate) delivery_timeout: Option<Duration>,
}

impl TryFrom<&KeyValue> for QueueConfig {
    type Error = BrokerError;

    fn try_from(kv: &KeyValue) -> Result<Self> {
        let delivery_timeout = match kv.get_u64(DELIVERY_TIMEOUT_MS)? {
            Some(0) => {
                return Err(BrokerError::InvalidConfig(format!(
                    "{} must be positive",
                    DELIVERY_TIMEOUT_MS
                )))
            }
            Some(ms) => Some(Duration::from_millis(ms)),
            None => None,
        };
        Ok(QueueConfig { delivery_timeout })
    }
}
