//! Configuration for Trellis.
//!
//! Configuration lives at `~/.trellis/config.toml` unless `TRELLIS_CONFIG_PATH`
//! points elsewhere. A handful of values can be overridden from the
//! environment:
//!
//! - `TRELLIS_LOG_LEVEL`
//! - `TRELLIS_PROJECTS_DIR`
//! - `TRELLIS_MAX_WORKERS`
//!
//! # Example
//!
//! ```no_run
//! use trellis_core::config::TrellisConfig;
//!
//! # async fn example() -> trellis_core::Result<()> {
//! let config = TrellisConfig::load_or_default().await?;
//! println!("Projects live under {}", config.workspace.projects_dir.display());
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, TrellisError};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// The current configuration version
pub const CONFIG_VERSION: &str = "0.1.0";

// Environment variable names
pub const ENV_CONFIG_PATH: &str = "TRELLIS_CONFIG_PATH";
pub const ENV_LOG_LEVEL: &str = "TRELLIS_LOG_LEVEL";
pub const ENV_PROJECTS_DIR: &str = "TRELLIS_PROJECTS_DIR";
pub const ENV_MAX_WORKERS: &str = "TRELLIS_MAX_WORKERS";

/// Upper bound for `sync.max_workers`
pub const MAX_WORKERS_LIMIT: usize = 1024;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrellisConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub environment: EnvironmentConfig,
}

/// General configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Configuration version for migration support
    pub version: String,
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
}

/// Where node project directories are created
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Root under which `<workspace>/<node>` project directories live
    pub projects_dir: PathBuf,
    /// Workspace name used when none is given
    pub default_name: String,
}

/// Concurrency limits for directory and flush work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum concurrent per-node flush/restore workers
    pub max_workers: usize,
    /// Invoke the environment provisioner for frameworks that need one
    pub provision_environments: bool,
}

/// Archive writing options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Deflate level, 0-9
    pub compression_level: u32,
    /// File extension used for new archives
    pub extension: String,
}

/// Which environment provisioner to use
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// `none` or `venv`
    pub provisioner: String,
    /// Interpreter used by the `venv` provisioner
    pub python: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION.to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        let base = TrellisConfig::base_dir().unwrap_or_else(|_| std::env::temp_dir().join("trellis"));
        Self {
            projects_dir: base.join("projects"),
            default_name: "Untitled Workspace".to_string(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_workers: num_cpus::get().clamp(1, MAX_WORKERS_LIMIT),
            provision_environments: true,
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            compression_level: 6,
            extension: "trellis".to_string(),
        }
    }
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            provisioner: "none".to_string(),
            python: "python3".to_string(),
        }
    }
}

impl TrellisConfig {
    /// Load configuration from the default location
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from_path(&config_path).await
    }

    /// Load configuration from a specific path
    pub async fn load_from_path(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| TrellisError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: Self = toml::from_str(&content)
            .map_err(|e| TrellisError::config(format!("Failed to parse config file: {}", e)))?;

        config.merge_env_vars()?;
        config.validate()?;

        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load the config file if present, otherwise use defaults.
    ///
    /// Environment overrides apply in both cases. Nothing is written to disk.
    pub async fn load_or_default() -> Result<Self> {
        let config_path = Self::config_path()?;
        if config_path.exists() {
            return Self::load_from_path(&config_path).await;
        }

        debug!("No config at {}, using defaults", config_path.display());
        let mut config = Self::default();
        config.merge_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a specific path atomically (temp file, then rename)
    pub async fn save_to_path(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        self.validate()?;

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    TrellisError::config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| TrellisError::config(format!("Failed to serialize config: {}", e)))?;

        let temp_path = path.with_extension("toml.tmp");

        tokio::fs::write(&temp_path, content)
            .await
            .map_err(|e| TrellisError::config(format!("Failed to write config file: {}", e)))?;

        tokio::fs::rename(&temp_path, path)
            .await
            .map_err(|e| TrellisError::config(format!("Failed to rename config file: {}", e)))?;

        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.general.log_level.as_str()) {
            return Err(TrellisError::config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.general.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if self.workspace.projects_dir.as_os_str().is_empty() {
            return Err(TrellisError::config("projects_dir must not be empty"));
        }

        if self.sync.max_workers == 0 || self.sync.max_workers > MAX_WORKERS_LIMIT {
            return Err(TrellisError::config(format!(
                "max_workers must be between 1 and {}, got {}",
                MAX_WORKERS_LIMIT, self.sync.max_workers
            )));
        }

        if self.archive.compression_level > 9 {
            return Err(TrellisError::config(format!(
                "compression_level must be between 0 and 9, got {}",
                self.archive.compression_level
            )));
        }

        let valid_provisioners = ["none", "venv"];
        if !valid_provisioners.contains(&self.environment.provisioner.as_str()) {
            return Err(TrellisError::config(format!(
                "Invalid provisioner '{}'. Must be one of: {}",
                self.environment.provisioner,
                valid_provisioners.join(", ")
            )));
        }

        Ok(())
    }

    /// Merge environment variable overrides into the configuration
    pub fn merge_env_vars(&mut self) -> Result<()> {
        self.merge_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup, keyed by the `ENV_*` names
    pub fn merge_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(log_level) = lookup(ENV_LOG_LEVEL) {
            debug!("Overriding log_level from environment: {}", log_level);
            self.general.log_level = log_level;
        }

        if let Some(dir) = lookup(ENV_PROJECTS_DIR) {
            debug!("Overriding projects_dir from environment: {}", dir);
            self.workspace.projects_dir = PathBuf::from(dir);
        }

        if let Some(workers) = lookup(ENV_MAX_WORKERS) {
            let workers = workers.parse::<usize>().map_err(|e| {
                TrellisError::config(format!("Invalid max workers in environment: {}", e))
            })?;
            debug!("Overriding max_workers from environment: {}", workers);
            self.sync.max_workers = workers;
        }

        Ok(())
    }

    /// Get the base Trellis directory path (~/.trellis/)
    pub fn base_dir() -> Result<PathBuf> {
        if let Ok(config_path) = std::env::var(ENV_CONFIG_PATH) {
            if let Some(parent) = PathBuf::from(config_path).parent() {
                return Ok(parent.to_path_buf());
            }
        }

        let base_dirs = BaseDirs::new()
            .ok_or_else(|| TrellisError::config("Could not determine home directory"))?;

        Ok(base_dirs.home_dir().join(".trellis"))
    }

    /// Get the configuration file path (~/.trellis/config.toml)
    pub fn config_path() -> Result<PathBuf> {
        if let Ok(config_path) = std::env::var(ENV_CONFIG_PATH) {
            return Ok(PathBuf::from(config_path));
        }

        Ok(Self::base_dir()?.join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_default_config_is_valid() {
        let config = TrellisConfig::default();
        assert_eq!(config.general.version, CONFIG_VERSION);
        assert_eq!(config.archive.compression_level, 6);
        assert!(config.sync.max_workers >= 1);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_config_validation() {
        let mut config = TrellisConfig::default();

        config.general.log_level = "loud".to_string();
        assert!(config.validate().is_err());
        config.general.log_level = "info".to_string();

        config.sync.max_workers = 0;
        assert!(config.validate().is_err());
        config.sync.max_workers = MAX_WORKERS_LIMIT + 1;
        assert!(config.validate().is_err());
        config.sync.max_workers = MAX_WORKERS_LIMIT;
        assert!(config.validate().is_ok());
        config.sync.max_workers = 2;

        config.archive.compression_level = 12;
        assert!(config.validate().is_err());
        config.archive.compression_level = 9;

        config.environment.provisioner = "conda".to_string();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_save_and_load_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut config = TrellisConfig::default();
        config.workspace.projects_dir = temp_dir.path().join("projects");
        config.archive.compression_level = 3;

        config.save_to_path(&config_path).await.unwrap();
        assert!(config_path.exists());
        assert!(!config_path.with_extension("toml.tmp").exists());

        let loaded = TrellisConfig::load_from_path(&config_path).await.unwrap();
        assert_eq!(loaded.archive.compression_level, 3);
        assert_eq!(loaded.workspace.projects_dir, temp_dir.path().join("projects"));
    }

    #[tokio::test]
    async fn test_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        tokio::fs::write(&config_path, "[archive]\ncompression_level = 1\nextension = \"zip\"\n")
            .await
            .unwrap();

        let loaded = TrellisConfig::load_from_path(&config_path).await.unwrap();
        assert_eq!(loaded.archive.extension, "zip");
        assert_eq!(loaded.environment.provisioner, "none");
    }

    #[tokio::test]
    async fn test_env_var_overrides() {
        let mut config = TrellisConfig::default();

        let vars: HashMap<&str, &str> = [
            (ENV_PROJECTS_DIR, "/tmp/trellis-projects"),
            (ENV_MAX_WORKERS, "3"),
        ]
        .into_iter()
        .collect();
        config
            .merge_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.workspace.projects_dir, PathBuf::from("/tmp/trellis-projects"));
        assert_eq!(config.sync.max_workers, 3);

        let bad = |key: &str| (key == ENV_MAX_WORKERS).then(|| "many".to_string());
        assert!(config.merge_overrides(bad).is_err());

        let huge = |key: &str| (key == ENV_MAX_WORKERS).then(|| usize::MAX.to_string());
        config.merge_overrides(huge).unwrap();
        assert_eq!(config.sync.max_workers, usize::MAX);
        assert!(config.validate().is_err());
    }
}
