//! Guest identity and engine configuration
//!
//! Protocol constants live in one immutable [`LemmaConfig`] handed to the
//! engine at construction. Every field has a default, so a TOML file only
//! needs the keys it overrides.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Dialect string hosts use to identify this guest library
pub const DIALECT: &str = "Cinder-NoamLemma";

/// Protocol version sent alongside the dialect
pub const VERSION: &str = "0.0.0";

/// UDP port hosts listen on for availability announcements
pub const DEFAULT_DISCOVERY_PORT: u16 = 1030;

const DEFAULT_BROADCAST_INTERVAL_MS: u64 = 3000;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5000;
const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Who this guest is. Fixed for the lifetime of a [`crate::Lemma`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    guest_name: String,
    room_name: String,
}

impl Identity {
    /// Create an identity. The guest name is required, the room may be empty.
    pub fn new(guest_name: impl Into<String>, room_name: impl Into<String>) -> Result<Self> {
        let guest_name = guest_name.into();
        if guest_name.trim().is_empty() {
            return Err(Error::InvalidIdentity("guest name must not be empty".into()));
        }
        Ok(Self {
            guest_name,
            room_name: room_name.into(),
        })
    }

    pub fn guest_name(&self) -> &str {
        &self.guest_name
    }

    pub fn room_name(&self) -> &str {
        &self.room_name
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LemmaConfig {
    /// Dialect sent in `marco` and `register`
    pub dialect: String,
    /// Version sent in `marco` and `register`
    pub version: String,
    /// Destination of availability announcements
    pub discovery_addr: IpAddr,
    /// Port hosts listen on for announcements
    pub discovery_port: u16,
    /// Time between announcements while no host has replied
    pub broadcast_interval_ms: u64,
    /// Time between heartbeats while connected
    pub heartbeat_interval_ms: u64,
    /// Size of a single socket read on the messaging session
    pub read_buffer_size: usize,
}

impl Default for LemmaConfig {
    fn default() -> Self {
        Self {
            dialect: DIALECT.to_string(),
            version: VERSION.to_string(),
            discovery_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            discovery_port: DEFAULT_DISCOVERY_PORT,
            broadcast_interval_ms: DEFAULT_BROADCAST_INTERVAL_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl LemmaConfig {
    /// Parse a config from TOML text
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load a config from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn discovery_target(&self) -> SocketAddr {
        SocketAddr::new(self.discovery_addr, self.discovery_port)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    /// Heartbeat interval advertised to the host, in whole seconds
    pub fn heartbeat_seconds(&self) -> u64 {
        self.heartbeat_interval_ms.div_ceil(1000).max(1)
    }
}
