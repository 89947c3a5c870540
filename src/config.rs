//! Process configuration
//!
//! The storage base directory is the only piece of configuration the core
//! consumes; it is read once at process start and never mutated. The other
//! fields locate the database, the working area used for release bundles and
//! the portal name stamped on release file names.

use crate::error::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable naming the configuration file
pub const CONFIG_ENV_VAR: &str = "LABVAULT_CONFIG_FP";

/// Default database file name, placed under the storage base
pub const DEFAULT_DATABASE_NAME: &str = "labvault.sqlite";

/// Configuration for a vault instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Storage base every mountpoint root is relative to
    pub base_data_dir: PathBuf,
    /// Scratch area; release bundles go to `working_dir/releases`
    pub working_dir: PathBuf,
    /// SQLite database file
    pub database_path: PathBuf,
    /// Portal name used in release file names
    #[serde(default = "default_portal")]
    pub portal: String,
    /// How long to wait for the connection lock, in milliseconds
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

fn default_portal() -> String {
    "QIITA".to_string()
}

fn default_lock_timeout_ms() -> u64 {
    10_000
}

impl VaultConfig {
    /// Configuration with every location derived from `base_data_dir`
    pub fn new(base_data_dir: impl Into<PathBuf>) -> Self {
        let base_data_dir = base_data_dir.into();
        Self {
            working_dir: base_data_dir.join("working_dir"),
            database_path: base_data_dir.join(DEFAULT_DATABASE_NAME),
            base_data_dir,
            portal: default_portal(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }

    /// Load a JSON configuration file
    ///
    /// # Errors
    ///
    /// - [`VaultError::Io`] if the file cannot be read
    /// - [`VaultError::Json`] if it is not a valid configuration
    /// - [`VaultError::InvalidConfiguration`] if validation fails
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading configuration from {:?}", path);
        let content = fs::read_to_string(path)?;
        let config: VaultConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file named by `LABVAULT_CONFIG_FP`
    pub fn from_env() -> Result<Self> {
        let path = std::env::var_os(CONFIG_ENV_VAR).ok_or_else(|| {
            VaultError::InvalidConfiguration(format!("{} is not set", CONFIG_ENV_VAR))
        })?;
        Self::load(Path::new(&path))
    }

    /// Write the configuration as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Reject configurations the core cannot work with
    pub fn validate(&self) -> Result<()> {
        if !self.base_data_dir.is_absolute() {
            return Err(VaultError::InvalidConfiguration(format!(
                "base_data_dir must be absolute, got {:?}",
                self.base_data_dir
            )));
        }
        if !self.base_data_dir.is_dir() {
            return Err(VaultError::InvalidConfiguration(format!(
                "base_data_dir {:?} does not exist",
                self.base_data_dir
            )));
        }
        if self.portal.is_empty() || self.portal.contains(['/', '\\']) {
            return Err(VaultError::InvalidConfiguration(format!(
                "portal name {:?} is not usable in a file name",
                self.portal
            )));
        }
        Ok(())
    }

    /// Directory release bundles are written to
    pub fn releases_dir(&self) -> PathBuf {
        self.working_dir.join("releases")
    }
}
