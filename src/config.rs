//! Configuration for agora-store

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agora-store")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the SQLite database
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Fingerprint of the local node. Remote node records may never use it.
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Width of the recent-history window served to unprivileged readers
    #[serde(default = "default_network_head_days")]
    pub network_head_days: u32,

    /// Upper bound on stored peer addresses; the oldest are pruned past it
    #[serde(default = "default_max_address_table_size")]
    pub max_address_table_size: u32,

    /// Require the proof-of-work field on provable entities
    #[serde(default = "default_true")]
    pub pow_check_enabled: bool,

    /// Accept 127.0.0.1 as a remote address (local test networks)
    #[serde(default)]
    pub allow_localhost_remotes: bool,

    /// Delay before retrying a transaction that hit a locked database
    #[serde(default = "default_lock_retry_backoff_ms")]
    pub lock_retry_backoff_ms: u64,

    /// Unix timestamp of the newest published cache (0 = none yet)
    #[serde(default)]
    pub last_cache_generation: i64,
}

fn default_node_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn default_network_head_days() -> u32 {
    14
}

fn default_max_address_table_size() -> u32 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_lock_retry_backoff_ms() -> u64 {
    10_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            node_id: default_node_id(),
            network_head_days: default_network_head_days(),
            max_address_table_size: default_max_address_table_size(),
            pow_check_enabled: true,
            allow_localhost_remotes: false,
            lock_retry_backoff_ms: default_lock_retry_backoff_ms(),
            last_cache_generation: 0,
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }
}
