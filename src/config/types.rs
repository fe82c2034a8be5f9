//! Configuration types and structures.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub sweeper: SweeperConfig,

    #[serde(default)]
    pub grid: GridConfig,

    #[serde(default)]
    pub splitting: SplittingConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration from a single YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Ensure the database directory exists.
    pub fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.server.db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

/// Server-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("tasking/tasking.db")
}

/// Auto-unlock sweeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Run the sweeper when serving (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between sweeps (default: 7200).
    #[serde(default = "default_sweep_interval")]
    pub interval_seconds: u64,

    /// Age in seconds after which a lock is considered abandoned (default: 7200).
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_seconds: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: default_sweep_interval(),
            lock_ttl_seconds: default_lock_ttl(),
        }
    }
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.max(1))
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_seconds)
    }
}

fn default_true() -> bool {
    true
}

fn default_sweep_interval() -> u64 {
    7200 // 2 hours
}

fn default_lock_ttl() -> u64 {
    7200 // 2 hours
}

/// Initial task grid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Most tiles a square-mode project may start with (default: 100000).
    #[serde(default = "default_max_grid_tasks")]
    pub max_tasks: u64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            max_tasks: default_max_grid_tasks(),
        }
    }
}

fn default_max_grid_tasks() -> u64 {
    100_000
}

/// Splitting engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplittingConfig {
    /// Recursive bisections per arbitrary-mode split (default: 2, four children).
    #[serde(default = "default_split_depth")]
    pub arbitrary_split_depth: u32,

    /// How many times an arbitrary-mode lineage may be split (default: 4).
    #[serde(default = "default_max_generations")]
    pub max_arbitrary_generations: u32,

    /// Acceptable area imbalance between bisected halves, as a fraction (default: 0.01).
    #[serde(default = "default_bisect_tolerance")]
    pub bisect_tolerance: f64,
}

impl Default for SplittingConfig {
    fn default() -> Self {
        Self {
            arbitrary_split_depth: default_split_depth(),
            max_arbitrary_generations: default_max_generations(),
            bisect_tolerance: default_bisect_tolerance(),
        }
    }
}

fn default_split_depth() -> u32 {
    2
}

fn default_max_generations() -> u32 {
    4
}

fn default_bisect_tolerance() -> f64 {
    0.01
}

/// Authorization policy used by [`crate::permissions::PolicyPermissions`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Whether a principal may validate their own mapping (default: true).
    #[serde(default = "default_true")]
    pub allow_self_validation: bool,

    /// Principals allowed to run bulk transitions.
    #[serde(default)]
    pub administrators: Vec<i64>,

    /// Principals denied every lock.
    #[serde(default)]
    pub blocked: Vec<i64>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allow_self_validation: true,
            administrators: Vec::new(),
            blocked: Vec::new(),
        }
    }
}

/// Storage behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Times a conflicted transaction is retried before surfacing the conflict (default: 1).
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,

    /// Milliseconds one attempt waits on another writer (default: 5000).
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl StorageConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            conflict_retries: default_conflict_retries(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_conflict_retries() -> u32 {
    1
}

fn default_busy_timeout_ms() -> u64 {
    5000
}
