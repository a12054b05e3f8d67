//! Runtime configuration, loaded from an optional JSON file.
//!
//! Every field has a default, so a partial file (or none at all) is valid.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::ingestion::validation::ValidationConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config {0}: {1}")]
    Parse(PathBuf, #[source] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the write-ahead log
    pub data_dir: PathBuf,
    /// Address for the Prometheus endpoint; disabled when absent
    pub metrics_addr: Option<SocketAddr>,
    pub wal: WalConfig,
    pub validation: ValidationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            metrics_addr: None,
            wal: WalConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Segment size in bytes after which a new segment is started
    pub max_segment_size: u64,
    /// Fsync after every append
    pub sync_on_write: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            max_segment_size: 64 * 1024 * 1024,
            sync_on_write: false,
        }
    }
}
