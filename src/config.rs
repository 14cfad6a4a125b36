//! Bus configuration.
//!
//! Defaults, overridden by JSON or by `COURIER_*` environment variables:
//!
//! | Variable                           | Field                       | Default     |
//! |------------------------------------|-----------------------------|-------------|
//! | `COURIER_APPLICATION_NAME`         | `application_name`          | `courier`   |
//! | `COURIER_INSTANCE_NAME`            | `instance_name`             | random      |
//! | `COURIER_DEFAULT_TIMEOUT_MS`       | `default_timeout_ms`        | `10000`     |
//! | `COURIER_MAX_CONCURRENT_DISPATCHES`| `max_concurrent_dispatches` | `16`        |
//! | `COURIER_FAULT_STREAM_CAPACITY`    | `fault_stream_capacity`     | `256`       |

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BusError;
use crate::pump::DEFAULT_FAULT_STREAM_CAPACITY;

/// Settings shared by every pump of a bus.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Names the competing event subscriptions shared by all instances.
    pub application_name: String,
    /// Names this instance's multicast subscriptions and reply queue.
    pub instance_name: String,
    pub default_timeout_ms: u64,
    /// Deliveries dispatched at once, per pump.
    pub max_concurrent_dispatches: usize,
    pub fault_stream_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            application_name: "courier".to_string(),
            instance_name: Uuid::new_v4().simple().to_string()[..8].to_string(),
            default_timeout_ms: 10_000,
            max_concurrent_dispatches: 16,
            fault_stream_capacity: DEFAULT_FAULT_STREAM_CAPACITY,
        }
    }
}

impl BusConfig {
    pub fn new(application_name: impl Into<String>, instance_name: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
            instance_name: instance_name.into(),
            ..Self::default()
        }
    }

    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    pub fn with_instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = name.into();
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = timeout.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    pub fn with_max_concurrent_dispatches(mut self, max: usize) -> Self {
        self.max_concurrent_dispatches = max;
        self
    }

    pub fn with_fault_stream_capacity(mut self, capacity: usize) -> Self {
        self.fault_stream_capacity = capacity;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Queue this instance receives its replies on.
    pub fn reply_queue(&self) -> String {
        format!("{}.{}.replies", self.application_name, self.instance_name)
    }

    /// Name of this instance's multicast subscriptions.
    pub fn multicast_subscription(&self) -> String {
        format!("{}.{}", self.application_name, self.instance_name)
    }

    /// Parse from JSON; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, BusError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| BusError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `COURIER_*` environment variables.
    pub fn from_env() -> Result<Self, BusError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, BusError> {
        let mut config = Self::default();
        if let Some(name) = lookup("COURIER_APPLICATION_NAME") {
            config.application_name = name;
        }
        if let Some(name) = lookup("COURIER_INSTANCE_NAME") {
            config.instance_name = name;
        }
        if let Some(value) = lookup("COURIER_DEFAULT_TIMEOUT_MS") {
            config.default_timeout_ms = parse("COURIER_DEFAULT_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = lookup("COURIER_MAX_CONCURRENT_DISPATCHES") {
            config.max_concurrent_dispatches = parse("COURIER_MAX_CONCURRENT_DISPATCHES", &value)?;
        }
        if let Some(value) = lookup("COURIER_FAULT_STREAM_CAPACITY") {
            config.fault_stream_capacity = parse("COURIER_FAULT_STREAM_CAPACITY", &value)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BusError> {
        if self.application_name.trim().is_empty() {
            return Err(BusError::Config("application_name must not be empty".into()));
        }
        if self.instance_name.trim().is_empty() {
            return Err(BusError::Config("instance_name must not be empty".into()));
        }
        if self.max_concurrent_dispatches == 0 {
            return Err(BusError::Config(
                "max_concurrent_dispatches must be at least 1".into(),
            ));
        }
        if self.fault_stream_capacity == 0 {
            return Err(BusError::Config("fault_stream_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, BusError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| BusError::Config(format!("{}={:?}: {}", key, value, e)))
}
