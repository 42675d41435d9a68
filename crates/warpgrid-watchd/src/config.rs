//! watchd.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use warpgrid_deploywatch::WatcherConfig;

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchdConfig {
    /// Directory holding `watchd.redb`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Keep state in memory only.
    #[serde(default)]
    pub in_memory: bool,

    /// Longest a blocking state query waits for a change.
    #[serde(default = "default_max_query_wait_ms")]
    pub max_query_wait_ms: u64,

    #[serde(default)]
    pub watcher: WatcherConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/warpgrid")
}

const fn default_max_query_wait_ms() -> u64 {
    5 * 60 * 1000
}

impl Default for WatchdConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            in_memory: false,
            max_query_wait_ms: default_max_query_wait_ms(),
            watcher: WatcherConfig::default(),
        }
    }
}

impl WatchdConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WatchdConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn max_query_wait(&self) -> Duration {
        Duration::from_millis(self.max_query_wait_ms)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("watchd.redb")
    }
}
