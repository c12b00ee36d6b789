//! Configuration system for meshsync.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MESHSYNC_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/meshsync/config.toml
//!   3. ~/.config/meshsync/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::wire::DEFAULT_MTU;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshSyncConfig {
    pub node: NodeConfig,
    pub link: LinkConfig,
    pub blob: BlobSyncConfig,
    pub clock: ClockSyncConfig,
    pub beacon: BeaconConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Hardware address, "aa:bb:cc:dd:ee:ff". Empty = derived from the link-local address.
    pub address: String,
    /// Largest frame handed to the transport, protocol id included.
    pub mtu: usize,
    /// Scheduling tick. One outbound packet at most per tick.
    pub tick_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Network interface name for the UDP link emulation.
    pub interface: String,
    /// UDP port every node binds and sends to.
    pub port: u16,
}

/// Timing and limits for the blob sync protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobSyncConfig {
    pub protocol_id: u8,
    /// Base advertise interval; actual interval is uniform in [base, 2*base).
    pub advertise_interval_ms: u32,
    /// Base retry interval while updating; also scales provider backoff.
    pub retry_interval_ms: u32,
    /// Minimum spacing between two PROVIDE packets from this node.
    pub provide_interval_ms: u32,
    /// Consecutive unanswered requests before an update is abandoned.
    pub max_retries: u8,
    /// How long a fresh node waits before calling itself up to date.
    pub startup_grace_ms: u32,
    /// Largest metadata a storage backend may attach to an advertise.
    pub max_metadata_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockSyncConfig {
    pub protocol_id: u8,
    /// Base broadcast interval; actual interval is uniform in [base, 2*base).
    pub transmit_interval_ms: u32,
    /// Corrections smaller than this are smoothed, larger ones step.
    pub smooth_threshold_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BeaconConfig {
    pub protocol_id: u8,
    /// Slot length on the synced clock. 0 disables the beacon.
    pub period_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the committed blob file and manifest.toml.
    pub blob_dir: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            mtu: DEFAULT_MTU,
            tick_ms: 5,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            interface: String::new(),
            port: 9100,
        }
    }
}

impl Default for BlobSyncConfig {
    fn default() -> Self {
        Self {
            protocol_id: 2,
            advertise_interval_ms: 15_000,
            retry_interval_ms: 1_000,
            provide_interval_ms: 10,
            max_retries: 5,
            startup_grace_ms: 30_000,
            max_metadata_len: 64,
        }
    }
}

impl Default for ClockSyncConfig {
    fn default() -> Self {
        Self {
            protocol_id: 1,
            transmit_interval_ms: 10_000,
            smooth_threshold_ms: 2_000,
        }
    }
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            protocol_id: 3,
            period_ms: 5_000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            blob_dir: data_dir().join("blob"),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("meshsync")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("meshsync")
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
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MeshSyncConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            MeshSyncConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MESHSYNC_CONFIG")
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
            let text = toml::to_string_pretty(&MeshSyncConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply MESHSYNC_* overrides. `lookup` is `std::env::var` in production.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("MESHSYNC_NODE__ADDRESS") {
            self.node.address = v;
        }
        if let Some(p) = lookup("MESHSYNC_NODE__MTU").and_then(|v| v.parse().ok()) {
            self.node.mtu = p;
        }
        if let Some(v) = lookup("MESHSYNC_LINK__INTERFACE") {
            self.link.interface = v;
        }
        if let Some(p) = lookup("MESHSYNC_LINK__PORT").and_then(|v| v.parse().ok()) {
            self.link.port = p;
        }
        if let Some(v) = lookup("MESHSYNC_STORAGE__BLOB_DIR") {
            self.storage.blob_dir = PathBuf::from(v);
        }
        if let Some(p) = lookup("MESHSYNC_BLOB__RETRY_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.blob.retry_interval_ms = p;
        }
        if let Some(p) = lookup("MESHSYNC_BLOB__ADVERTISE_INTERVAL_MS").and_then(|v| v.parse().ok())
        {
            self.blob.advertise_interval_ms = p;
        }
        if let Some(p) = lookup("MESHSYNC_BEACON__PERIOD_MS").and_then(|v| v.parse().ok()) {
            self.beacon.period_ms = p;
        }
    }
}
