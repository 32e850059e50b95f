use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::{
    DEFAULT_LIVENESS_WINDOW_SECS, DEFAULT_SWEEP_INTERVAL_SECS, SAP_MULTICAST_GROUP, SAP_PORT,
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub inventory: InventoryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Interface to join the SAP group on; all IPv4 interfaces when unset
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default = "default_group")]
    pub group: Ipv4Addr,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InventoryConfig {
    /// Database file; the per-user working directory when unset
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    #[serde(default = "default_liveness_window")]
    pub liveness_window_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_group() -> Ipv4Addr {
    SAP_MULTICAST_GROUP
}

fn default_port() -> u16 {
    SAP_PORT
}

fn default_liveness_window() -> u64 {
    DEFAULT_LIVENESS_WINDOW_SECS
}

fn default_sweep_interval() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            interface: None,
            group: default_group(),
            port: default_port(),
        }
    }
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            liveness_window_secs: default_liveness_window(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.listener.group.is_multicast() {
            anyhow::bail!("listener.group {} is not a multicast address", self.listener.group);
        }
        if self.inventory.sweep_interval_secs == 0 {
            anyhow::bail!("inventory.sweep_interval_secs must be at least 1");
        }
        if self.inventory.liveness_window_secs == 0 {
            anyhow::bail!("inventory.liveness_window_secs must be at least 1");
        }
        Ok(())
    }
}
