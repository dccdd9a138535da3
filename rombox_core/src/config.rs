//! Configuration loaded from TOML.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default worker count.
pub const DEFAULT_WORKERS: usize = 4;

/// Upper bound on worker count.
pub const MAX_WORKERS: usize = 8;

/// One entry of the ordered depot table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepotConfig {
    /// Directory containers are placed under.
    pub root: PathBuf,
    /// Capacity in gigabytes. Carried for reporting, not enforced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<u64>,
    /// Offline roots are skipped for placement and lookup.
    #[serde(default = "default_online")]
    pub online: bool,
}

fn default_online() -> bool {
    true
}

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker threads for bucketing and hashing (clamped to 1..=8).
    pub workers: usize,
    /// Root directory of DAT files.
    pub dats: PathBuf,
    /// Index location; rows are persisted next to it with a `.rows` extension.
    pub db: PathBuf,
    /// Staging directory for freshly encoded containers.
    pub tmpdir: PathBuf,
    /// Depot roots in placement order.
    pub depots: Vec<DepotConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            dats: PathBuf::from("dats"),
            db: PathBuf::from("db"),
            tmpdir: PathBuf::from("tmp"),
            depots: vec![DepotConfig {
                root: PathBuf::from("depot"),
                max_size: None,
                online: true,
            }],
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(Error::not_found(path)),
            Err(e) => return Err(e.into()),
        };
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.workers = config.workers.clamp(1, MAX_WORKERS);
        Ok(config)
    }

    /// Path of the persisted row file.
    pub fn rows_path(&self) -> PathBuf {
        self.db.with_extension("rows")
    }

    /// Depot roots that are online, in table order.
    pub fn online_depots(&self) -> impl Iterator<Item = &DepotConfig> {
        self.depots.iter().filter(|d| d.online)
    }

    /// Build the worker pool sized by `workers`.
    pub fn thread_pool(&self) -> Result<Arc<rayon::ThreadPool>> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers.clamp(1, MAX_WORKERS))
            .thread_name(|i| format!("rombox-worker-{}", i))
            .build()
            .map(Arc::new)
            .map_err(|e| Error::invalid_config(format!("Failed to build worker pool: {}", e)))
    }
}
