/**
 * config.rs
 *
 * Coordinator client configuration. Defaults are the compiled-in public
 * endpoints; a TOML file may override any field.
 */

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const COORDINATOR_SERVER_HOST: &str = "coordinator.openttd.org";
pub const COORDINATOR_SERVER_PORT: u16 = 3976;
pub const STUN_SERVER_HOST: &str = "stun.openttd.org";
pub const STUN_SERVER_PORT: u16 = 3975;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Game Coordinator endpoint
    pub coordinator_host: String,
    pub coordinator_port: u16,

    /// STUN endpoint used to pin local ports
    pub stun_host: String,
    pub stun_port: u16,

    /// Seconds between server UPDATE heartbeats
    pub update_interval_secs: u64,

    /// Reconnect backoff bounds, in seconds
    pub reconnect_min_secs: u64,
    pub reconnect_max_secs: u64,

    /// Also probe over IPv6 when the host supports it
    pub enable_ipv6: bool,

    /// Our network revision; listed servers are checked against it
    pub revision: String,

    /// trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            coordinator_host: COORDINATOR_SERVER_HOST.to_string(),
            coordinator_port: COORDINATOR_SERVER_PORT,
            stun_host: STUN_SERVER_HOST.to_string(),
            stun_port: STUN_SERVER_PORT,
            update_interval_secs: 30,
            reconnect_min_secs: 1,
            reconnect_max_secs: 30,
            enable_ipv6: true,
            revision: env!("CARGO_PKG_VERSION").to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl CoordinatorConfig {
    /// Load from a TOML file; missing fields keep their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Invalid TOML")?;
        Ok(config)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn reconnect_min(&self) -> Duration {
        Duration::from_secs(self.reconnect_min_secs.max(1))
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_secs).max(self.reconnect_min())
    }
}
