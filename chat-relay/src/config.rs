//! Settings for the relay and the client.
//!
//! Both structs deserialize from JSON with every field optional; missing
//! fields take the defaults below. Command-line flags are applied on top by
//! [`crate::cli`].

use std::{fs, net::SocketAddr, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{codec::Framing, error::ConfigError};

pub const DEFAULT_ADDR: ([u8; 4], u16) = ([127, 0, 0, 1], 12345);
pub const DEFAULT_BACKLOG: u32 = 5;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_RECONNECT_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_RECONNECT_MAX: Duration = Duration::from_secs(16);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub backlog: u32,
    pub framing: Framing,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(DEFAULT_ADDR),
            backlog: DEFAULT_BACKLOG,
            framing: Framing::default(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backlog == 0 {
            return Err(ConfigError::ZeroBacklog);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub server: SocketAddr,
    /// Display name announced on every connect. A generated `User-<n>` name
    /// is used when absent or blank.
    pub name: Option<String>,
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    #[serde(rename = "poll_timeout_ms", with = "millis")]
    pub poll_timeout: Duration,
    #[serde(rename = "reconnect_base_ms", with = "millis")]
    pub reconnect_base: Duration,
    #[serde(rename = "reconnect_max_ms", with = "millis")]
    pub reconnect_max: Duration,
    pub framing: Framing,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: SocketAddr::from(DEFAULT_ADDR),
            name: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            reconnect_base: DEFAULT_RECONNECT_BASE,
            reconnect_max: DEFAULT_RECONNECT_MAX,
            framing: Framing::default(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reconnect_base.is_zero() {
            return Err(ConfigError::ZeroReconnectBase);
        }
        if self.reconnect_base > self.reconnect_max {
            return Err(ConfigError::ReconnectBaseExceedsMax {
                base: self.reconnect_base,
                max: self.reconnect_max,
            });
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("connect timeout"));
        }
        if self.poll_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("poll timeout"));
        }
        Ok(())
    }
}

/// Reads a JSON settings file, or returns the defaults when no path is given.
pub fn load<T>(path: Option<&Path>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let Some(path) = path else {
        return Ok(T::default());
    };

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
