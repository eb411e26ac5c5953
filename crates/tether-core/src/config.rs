//! Configuration system for tether.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TETHER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/tether/config.toml
//!   3. ~/.config/tether/config.toml

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::{
    NodeId, DEFAULT_ANNOUNCE_INTERVAL_MS, DEFAULT_DISCOVERY_PORT, DEFAULT_EXPIRATION_FACTOR,
    DEFAULT_MULTICAST_GROUP,
};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub identity: IdentityConfig,
    pub discovery: DiscoveryConfig,
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Stable node name. Empty = random identity on every start.
    pub node_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// UDP endpoint to bind for receiving announces. Not the multicast group.
    pub bind: SocketAddr,
    /// Where announces are sent. Usually a multicast group; a unicast
    /// address works too and is handy for tests.
    pub group: SocketAddr,
    /// Announce period in milliseconds.
    pub interval_ms: u64,
    /// Peers silent for `interval_ms * expiration_factor` are evicted.
    pub expiration_factor: u32,
    /// Interface for IPv6 multicast. Empty = let the OS choose.
    pub interface: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Endpoints this node advertises to peers.
    pub endpoints: Vec<SocketAddr>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for DiscoveryConfig {
    fn default() -> Self {
        let group: IpAddr = DEFAULT_MULTICAST_GROUP
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(239, 255, 0, 1)));
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_DISCOVERY_PORT),
            group: SocketAddr::new(group, DEFAULT_DISCOVERY_PORT),
            interval_ms: DEFAULT_ANNOUNCE_INTERVAL_MS,
            expiration_factor: DEFAULT_EXPIRATION_FACTOR,
            interface: String::new(),
        }
    }
}

impl DiscoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    /// How long a peer may stay silent before it is evicted.
    pub fn expiration(&self) -> Duration {
        self.interval() * self.expiration_factor.max(1)
    }
}

impl IdentityConfig {
    /// Resolve the configured identity.
    pub fn node_id(&self) -> NodeId {
        if self.node_name.is_empty() {
            NodeId::random()
        } else {
            NodeId::from_name(&self.node_name)
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("tether")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid value for {0}: {1:?}")]
    InvalidOverride(&'static str, String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TetherConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            TetherConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TETHER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&TetherConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply TETHER_* overrides. `lookup` is `std::env::var` outside tests.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TETHER_IDENTITY__NODE_NAME") {
            self.identity.node_name = v;
        }
        if let Some(v) = lookup("TETHER_DISCOVERY__BIND") {
            self.discovery.bind = v
                .parse()
                .map_err(|_| ConfigError::InvalidOverride("TETHER_DISCOVERY__BIND", v))?;
        }
        if let Some(v) = lookup("TETHER_DISCOVERY__GROUP") {
            self.discovery.group = v
                .parse()
                .map_err(|_| ConfigError::InvalidOverride("TETHER_DISCOVERY__GROUP", v))?;
        }
        if let Some(v) = lookup("TETHER_DISCOVERY__INTERVAL_MS") {
            self.discovery.interval_ms = v
                .parse()
                .map_err(|_| ConfigError::InvalidOverride("TETHER_DISCOVERY__INTERVAL_MS", v))?;
        }
        if let Some(v) = lookup("TETHER_NETWORK__ENDPOINTS") {
            self.network.endpoints = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<SocketAddr>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| ConfigError::InvalidOverride("TETHER_NETWORK__ENDPOINTS", v))?;
        }
        Ok(())
    }
}
