//! Runtime-adjustable timing settings.
//!
//! Serialized with millisecond integers so a bootstrapping layer can load
//! them from any serde format:
//!
//! ```json
//! {"ping_interval_ms":5000,"join_delay_ms":1000,"read_timeout_ms":15000}
//! ```
//!
//! Missing fields fall back to their defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("read timeout ({read_timeout:?}) must be longer than the ping interval ({ping_interval:?})")]
    ReadTimeoutTooShort {
        read_timeout: Duration,
        ping_interval: Duration,
    },
}

/// Timing knobs for one cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// How often each link sends a ping (default: 5s)
    #[serde(rename = "ping_interval_ms", with = "millis", default = "default_ping_interval")]
    pub ping_interval: Duration,
    /// Grace period between registering a link and announcing it (default: 1s)
    #[serde(rename = "join_delay_ms", with = "millis", default = "default_join_delay")]
    pub join_delay: Duration,
    /// Silence on a link longer than this drops it (default: 15s)
    #[serde(rename = "read_timeout_ms", with = "millis", default = "default_read_timeout")]
    pub read_timeout: Duration,
    /// Pause between dialer passes (default: 1.5s)
    #[serde(rename = "connect_interval_ms", with = "millis", default = "default_connect_interval")]
    pub connect_interval: Duration,
    /// Bound on a single outgoing TCP connect (default: 10s)
    #[serde(rename = "connect_timeout_ms", with = "millis", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
}

fn default_ping_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_join_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_connect_interval() -> Duration {
    Duration::from_millis(1500)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ping_interval: default_ping_interval(),
            join_delay: default_join_delay(),
            read_timeout: default_read_timeout(),
            connect_interval: default_connect_interval(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl Settings {
    /// Check the settings can keep links alive.
    ///
    /// A zero join delay is allowed; every other duration must be positive,
    /// and the read timeout must outlast the ping interval or healthy links
    /// would time out between pings.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let required = [
            ("ping interval", self.ping_interval),
            ("read timeout", self.read_timeout),
            ("connect interval", self.connect_interval),
            ("connect timeout", self.connect_timeout),
        ];
        for (name, value) in required {
            if value.is_zero() {
                return Err(SettingsError::Zero(name));
            }
        }
        if self.read_timeout <= self.ping_interval {
            return Err(SettingsError::ReadTimeoutTooShort {
                read_timeout: self.read_timeout,
                ping_interval: self.ping_interval,
            });
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
