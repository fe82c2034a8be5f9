//! Configuration loader with tier-based merging.

use super::merge::deep_merge_all;
use super::types::Config;
use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Configuration tier priority (lowest to highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigTier {
    /// Embedded defaults (lowest priority)
    Defaults = 0,
    /// Project-level config ($CWD/tasking/)
    Project = 1,
    /// User-level config (~/.tasking/)
    User = 2,
    /// Environment variables (highest priority)
    Environment = 3,
}

impl std::fmt::Display for ConfigTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigTier::Defaults => write!(f, "defaults"),
            ConfigTier::Project => write!(f, "project"),
            ConfigTier::User => write!(f, "user"),
            ConfigTier::Environment => write!(f, "environment"),
        }
    }
}

/// Directories searched for `config.yaml`.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub project_dir: Option<PathBuf>,
    pub user_dir: Option<PathBuf>,
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self::discover()
    }
}

impl ConfigPaths {
    /// Discover configuration paths from environment and defaults.
    pub fn discover() -> Self {
        // User dir: TASKING_USER_DIR or ~/.tasking
        let user_dir = std::env::var("TASKING_USER_DIR")
            .ok()
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".tasking")));

        // Project dir: TASKING_PROJECT_DIR or $CWD/tasking
        let project_dir = std::env::var("TASKING_PROJECT_DIR")
            .ok()
            .map(PathBuf::from)
            .or_else(|| Some(PathBuf::from("tasking")));

        Self {
            project_dir,
            user_dir,
        }
    }

    /// Create paths with explicit directories.
    pub fn with_dirs(project_dir: Option<PathBuf>, user_dir: Option<PathBuf>) -> Self {
        Self {
            project_dir,
            user_dir,
        }
    }
}

/// Loads and merges configuration tiers.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    pub paths: ConfigPaths,
    config: Config,
    /// Files that contributed to the merged config, lowest tier first.
    sources: Vec<(ConfigTier, PathBuf)>,
}

impl ConfigLoader {
    /// Load configuration from all tiers with proper merging.
    pub fn load() -> Result<Self> {
        Self::load_with_paths(ConfigPaths::discover())
    }

    /// Load configuration with explicit paths.
    pub fn load_with_paths(paths: ConfigPaths) -> Result<Self> {
        // Explicit config file overrides every tier except the environment.
        if let Ok(explicit_path) = std::env::var("TASKING_CONFIG_PATH") {
            let path = PathBuf::from(&explicit_path);
            let mut config = Config::load(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))?;
            apply_env_overrides(&mut config);
            return Ok(Self {
                paths,
                config,
                sources: vec![(ConfigTier::Project, path)],
            });
        }

        let mut layers: Vec<Value> = vec![serde_json::to_value(Config::default())?];
        let mut sources = Vec::new();

        let tiers = [
            (ConfigTier::Project, paths.project_dir.clone()),
            (ConfigTier::User, paths.user_dir.clone()),
        ];
        for (tier, dir) in tiers {
            let Some(dir) = dir else { continue };
            let file = dir.join("config.yaml");
            if let Some(layer) = read_yaml_layer(&file) {
                debug!(tier = %tier, path = %file.display(), "Loaded config layer");
                layers.push(layer);
                sources.push((tier, file));
            }
        }

        let mut config: Config = serde_json::from_value(deep_merge_all(layers))?;
        apply_env_overrides(&mut config);

        Ok(Self {
            paths,
            config,
            sources,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn into_config(self) -> Config {
        self.config
    }

    /// Path of the highest-tier file that was loaded, if any.
    pub fn config_path(&self) -> Option<&Path> {
        self.sources.last().map(|(_, path)| path.as_path())
    }

    pub fn sources(&self) -> &[(ConfigTier, PathBuf)] {
        &self.sources
    }
}

/// Read a YAML file as a JSON value. Missing files are skipped silently,
/// unreadable ones with a warning.
fn read_yaml_layer(file: &Path) -> Option<Value> {
    if !file.exists() {
        return None;
    }
    let content = match std::fs::read_to_string(file) {
        Ok(content) => content,
        Err(e) => {
            warn!(path = %file.display(), error = %e, "Skipping unreadable config file");
            return None;
        }
    };
    match serde_yaml::from_str::<Value>(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %file.display(), error = %e, "Skipping invalid config file");
            None
        }
    }
}

/// Apply environment variable overrides to config.
fn apply_env_overrides(config: &mut Config) {
    if let Ok(db_path) = std::env::var("TASKING_DB_PATH") {
        config.server.db_path = PathBuf::from(db_path);
    }

    if let Some(ttl) = env_u64("TASKING_LOCK_TTL_SECONDS") {
        config.sweeper.lock_ttl_seconds = ttl;
    }

    if let Some(interval) = env_u64("TASKING_SWEEP_INTERVAL_SECONDS") {
        config.sweeper.interval_seconds = interval;
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "Ignoring non-numeric environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn project_then_user_layers_merge() {
        let project = TempDir::new().unwrap();
        let user = TempDir::new().unwrap();
        std::fs::write(
            project.path().join("config.yaml"),
            "sweeper:\n  lock_ttl_seconds: 600\n  interval_seconds: 300\n",
        )
        .unwrap();
        std::fs::write(
            user.path().join("config.yaml"),
            "sweeper:\n  interval_seconds: 60\npolicy:\n  administrators: [4]\n",
        )
        .unwrap();

        let loader = ConfigLoader::load_with_paths(ConfigPaths::with_dirs(
            Some(project.path().to_path_buf()),
            Some(user.path().to_path_buf()),
        ))
        .unwrap();

        let config = loader.config();
        assert_eq!(config.sweeper.lock_ttl_seconds, 600);
        assert_eq!(config.sweeper.interval_seconds, 60);
        assert_eq!(config.policy.administrators, vec![4]);
        assert_eq!(loader.sources().len(), 2);
        assert_eq!(loader.sources()[0].0, ConfigTier::Project);
    }

    #[test]
    fn invalid_layer_is_skipped() {
        let project = TempDir::new().unwrap();
        std::fs::write(project.path().join("config.yaml"), "sweeper: [unclosed").unwrap();

        let loader = ConfigLoader::load_with_paths(ConfigPaths::with_dirs(
            Some(project.path().to_path_buf()),
            None,
        ))
        .unwrap();

        assert!(loader.config_path().is_none());
        assert!(loader.config().sweeper.enabled);
    }

    #[test]
    fn missing_dirs_yield_defaults() {
        let loader = ConfigLoader::load_with_paths(ConfigPaths::with_dirs(None, None)).unwrap();
        assert!(loader.sources().is_empty());
        assert!(loader.config().policy.allow_self_validation);
    }
}
