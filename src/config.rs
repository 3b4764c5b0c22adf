// src/config.rs

//! Manages node configuration: loading, resolving dynamic values, and validation.

use crate::core::cluster::ClusterConfig;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::{Arc, Mutex};

/// A simple wrapper to allow cloning the config while it's behind a mutex.
pub trait IntoMutex: Sized {
    fn into_mutex(self) -> Arc<Mutex<Self>>;
}

impl IntoMutex for Config {
    fn into_mutex(self) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(self))
    }
}

/// The on-disk shape of the config file, with defaults filled in for every
/// field a node doesn't bother setting explicitly.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
struct RawConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    cluster: ClusterConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    6380
}
fn default_log_level() -> String {
    "info".to_string()
}

/// A node's resolved configuration: its client-facing address (the bus
/// port is derived from it via `cluster.bus_port_offset`), logging, and
/// the cluster tuning knobs in [`ClusterConfig`] (which also names the
/// atomically-persisted peer directory file).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;

        let config = Config {
            host: raw.host,
            port: raw.port,
            log_level: raw.log_level,
            cluster: raw.cluster,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.cluster.config_file.trim().is_empty() {
            return Err(anyhow!("cluster.config_file cannot be empty"));
        }
        let bus_port = self.port as u32 + self.cluster.bus_port_offset as u32;
        if bus_port > u16::MAX as u32 {
            return Err(anyhow!(
                "port {} plus bus_port_offset {} exceeds the maximum port number",
                self.port,
                self.cluster.bus_port_offset
            ));
        }
        if self.cluster.gossip_fanout == 0 {
            return Err(anyhow!("cluster.gossip_fanout cannot be 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_port_is_rejected() {
        let mut c = Config::default();
        c.port = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn bus_port_overflow_is_rejected() {
        let mut c = Config::default();
        c.port = u16::MAX;
        c.cluster.bus_port_offset = 1;
        assert!(c.validate().is_err());
    }
}
