//! Global configuration model for dbox.
//!
//! Values are layered: built-in defaults, then `<data_dir>/config.json` when it
//! exists, then `DBOX_*` environment variables. Command-line flags are applied
//! on top by the CLI.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{DboxError, Result};

/// Environment variable overriding the image.
pub const ENV_IMAGE: &str = "DBOX_IMAGE";
/// Environment variable overriding the data directory.
pub const ENV_DATA_DIR: &str = "DBOX_DATA_DIR";
/// Environment variable overriding the engine binary.
pub const ENV_ENGINE: &str = "DBOX_ENGINE";
/// Environment variable overriding the lock timeout in seconds.
pub const ENV_LOCK_TIMEOUT: &str = "DBOX_LOCK_TIMEOUT";

/// Backoff settings for transient engine failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound for a single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay_ms: 200,
            max_delay_ms: 2_000,
        }
    }
}

/// Root configuration for dbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DboxConfig {
    /// Base directory for session records and locks.
    pub data_dir: PathBuf,
    /// Image new sessions are created from.
    pub image: String,
    /// Container engine binary name or path.
    pub engine_binary: String,
    /// Seconds to wait for a session lock.
    pub lock_timeout_secs: u64,
    /// Retry policy for transient engine failures.
    pub retry: RetrySettings,
    /// Extra mounts added to new sessions, in `HOST[:CONTAINER][:ro|rw]` form.
    pub mounts: Vec<String>,
    /// Environment passed to every executed command.
    pub env: Vec<(String, String)>,
    /// Subordinate UID allocation file.
    pub subuid_path: PathBuf,
    /// Subordinate GID allocation file.
    pub subgid_path: PathBuf,
}

impl Default for DboxConfig {
    fn default() -> Self {
        Self {
            data_dir: constants::default_data_dir(),
            image: constants::DEFAULT_IMAGE.to_string(),
            engine_binary: constants::DEFAULT_ENGINE.to_string(),
            lock_timeout_secs: constants::DEFAULT_LOCK_TIMEOUT_SECS,
            retry: RetrySettings::default(),
            mounts: Vec::new(),
            env: Vec::new(),
            subuid_path: PathBuf::from(constants::SUBUID_PATH),
            subgid_path: PathBuf::from(constants::SUBGID_PATH),
        }
    }
}

impl DboxConfig {
    /// Loads configuration from defaults, the config file, and the environment.
    ///
    /// `data_dir` overrides the default data directory before the config file
    /// is looked up.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or
    /// parsed, or if an environment override is malformed.
    pub fn load(data_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = data_dir
            .or_else(|| std::env::var_os(ENV_DATA_DIR).map(PathBuf::from))
            .unwrap_or_else(constants::default_data_dir);
        let file = Self::config_file_in(&data_dir);
        let mut config = if file.exists() {
            Self::from_file(&file)?
        } else {
            Self::default()
        };
        config.data_dir = data_dir;
        config.apply_env(|key| std::env::var(key).ok())?;
        tracing::debug!(
            data_dir = %config.data_dir.display(),
            image = %config.image,
            "configuration loaded"
        );
        Ok(config)
    }

    /// Parses a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| DboxError::io(path, e))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Applies `DBOX_*` overrides from the given lookup function.
    ///
    /// # Errors
    ///
    /// Returns `DboxError::Config` if the lock timeout is not a number.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(image) = lookup(ENV_IMAGE).filter(|v| !v.is_empty()) {
            self.image = image;
        }
        if let Some(engine) = lookup(ENV_ENGINE).filter(|v| !v.is_empty()) {
            self.engine_binary = engine;
        }
        if let Some(timeout) = lookup(ENV_LOCK_TIMEOUT) {
            self.lock_timeout_secs = timeout.trim().parse().map_err(|_| DboxError::Config {
                message: format!("{ENV_LOCK_TIMEOUT} must be a number of seconds, got {timeout:?}"),
            })?;
        }
        Ok(())
    }

    /// Path of the config file inside a data directory.
    #[must_use]
    pub fn config_file_in(data_dir: &Path) -> PathBuf {
        data_dir.join("config.json")
    }

    /// Directory holding one JSON record per session.
    #[must_use]
    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    /// Directory holding session lock files.
    #[must_use]
    pub fn locks_dir(&self) -> PathBuf {
        self.data_dir.join("locks")
    }

    /// Lock timeout as a duration.
    #[must_use]
    pub const fn lock_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.lock_timeout_secs)
    }
}
