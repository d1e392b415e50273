//! Node configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{GripError, Result};
use crate::reclaim::{ReclaimPolicy, ReclaimTier, DEFAULT_EXHAUSTED_MESSAGE};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub reclaim: ReclaimConfig,
    #[serde(default)]
    pub account: AccountConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Human readable node name, used in logs
    pub id: String,

    /// Data directory
    pub data_dir: PathBuf,

    /// ed25519 key file (defaults to `<data_dir>/node.key`)
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Graph database (defaults to `<data_dir>/grip.db`)
    #[serde(default)]
    pub database: Option<PathBuf>,

    /// Blob directory (defaults to `<data_dir>`, blobs land under `blobs/`)
    #[serde(default)]
    pub blob_dir: Option<PathBuf>,
}

/// Reclamation tier order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReclaimConfig {
    #[serde(default = "default_tiers")]
    pub tiers: Vec<ReclaimTier>,

    /// Account message set when every tier is exhausted
    #[serde(default = "default_exhausted_message")]
    pub exhausted_message: String,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
            exhausted_message: default_exhausted_message(),
        }
    }
}

/// The account local contexts are charged to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    #[serde(default = "default_account_id")]
    pub id: String,

    /// Quota, e.g. "10GB" or "512MB"
    #[serde(default = "default_max_disk_space")]
    pub max_disk_space: String,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            id: default_account_id(),
            max_disk_space: default_max_disk_space(),
        }
    }
}

// Defaults
fn default_tiers() -> Vec<ReclaimTier> { ReclaimPolicy::default().tiers }
fn default_exhausted_message() -> String { DEFAULT_EXHAUSTED_MESSAGE.to_string() }
fn default_account_id() -> String { "local".to_string() }
fn default_max_disk_space() -> String { "10GB".to_string() }

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                id: "grip-node".to_string(),
                data_dir: PathBuf::from("/var/lib/grip"),
                key_file: None,
            },
            storage: StorageConfig::default(),
            reclaim: ReclaimConfig::default(),
            account: AccountConfig::default(),
        }
    }
}

impl Config {
    /// Load `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn key_file(&self) -> PathBuf {
        self.node
            .key_file
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("node.key"))
    }

    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("grip.db"))
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.storage
            .blob_dir
            .clone()
            .unwrap_or_else(|| self.node.data_dir.clone())
    }

    pub fn reclaim_policy(&self) -> Result<ReclaimPolicy> {
        if self.reclaim.tiers.is_empty() {
            return Err(GripError::Config("reclaim.tiers must not be empty".to_string()));
        }
        Ok(ReclaimPolicy {
            tiers: self.reclaim.tiers.clone(),
            exhausted_message: self.reclaim.exhausted_message.clone(),
        })
    }

    pub fn max_disk_space(&self) -> Result<u64> {
        parse_size(&self.account.max_disk_space)
    }
}

/// Parse a byte size such as `"500MB"`, `"10 GB"` or `"4096"` (binary units).
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: u64 = number
        .parse()
        .map_err(|_| GripError::Config(format!("invalid size: {:?}", s)))?;

    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "KB" | "K" => 1 << 10,
        "MB" | "M" => 1 << 20,
        "GB" | "G" => 1 << 30,
        "TB" | "T" => 1 << 40,
        other => return Err(GripError::Config(format!("unknown size unit: {:?}", other))),
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| GripError::Config(format!("size too large: {:?}", s)))
}
