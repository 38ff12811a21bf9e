//! Provider settings, persisted as JSON.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors loading or saving settings.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid settings file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no configuration directory on this platform")]
    NoConfigDir,
}

fn default_local_timeout() -> u64 {
    30
}

fn default_network_timeout() -> u64 {
    600
}

fn default_auto_fetch() -> Option<u64> {
    Some(30)
}

fn default_remote() -> String {
    "origin".to_string()
}

/// User-facing provider configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Path to the git binary; looked up on `PATH` when unset.
    pub binary_path: Option<PathBuf>,
    /// Working tree root; discovered from the current directory when unset.
    pub repository_root: Option<PathBuf>,
    pub using_lfs_locking: bool,
    /// LFS lock owner name of the current user; defaults to `user.name`.
    pub lock_user: Option<String>,
    #[serde(default = "default_local_timeout")]
    pub local_timeout_secs: u64,
    #[serde(default = "default_network_timeout")]
    pub network_timeout_secs: u64,
    /// Background fetch interval; `None` disables it.
    #[serde(default = "default_auto_fetch")]
    pub auto_fetch_interval_secs: Option<u64>,
    #[serde(default = "default_remote")]
    pub remote_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            binary_path: None,
            repository_root: None,
            using_lfs_locking: false,
            lock_user: None,
            local_timeout_secs: default_local_timeout(),
            network_timeout_secs: default_network_timeout(),
            auto_fetch_interval_secs: default_auto_fetch(),
            remote_name: default_remote(),
        }
    }
}

impl Settings {
    /// `<config dir>/gitsc/settings.json`
    pub fn default_path() -> Result<PathBuf, SettingsError> {
        dirs::config_dir()
            .map(|d| d.join("gitsc").join("settings.json"))
            .ok_or(SettingsError::NoConfigDir)
    }

    /// Load settings from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No settings at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn local_timeout(&self) -> Duration {
        Duration::from_secs(self.local_timeout_secs)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }

    pub fn auto_fetch_interval(&self) -> Option<Duration> {
        self.auto_fetch_interval_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
    }
}
