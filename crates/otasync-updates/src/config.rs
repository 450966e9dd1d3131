//! Updater configuration
//!
//! Values come from an optional TOML file layered under `OTASYNC__*`
//! environment variables, e.g. `OTASYNC__CHANNEL=nightly` or
//! `OTASYNC__BUILD__TIMESTAMP=1700000000`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::{Result, UpdateError};

/// Environment variable prefix
const ENV_PREFIX: &str = "OTASYNC";

/// How often the periodic check runs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CheckInterval {
    #[default]
    Daily,
    Weekly,
    Monthly,
}

impl CheckInterval {
    pub fn as_duration(&self) -> Duration {
        const DAY: u64 = 24 * 60 * 60;
        match self {
            CheckInterval::Daily => Duration::from_secs(DAY),
            CheckInterval::Weekly => Duration::from_secs(7 * DAY),
            CheckInterval::Monthly => Duration::from_secs(30 * DAY),
        }
    }
}

/// Build currently running on the device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceBuild {
    /// Dotted version, e.g. "21.0"
    pub version: String,
    /// Build time in seconds since the epoch
    pub timestamp: i64,
    /// Incremental build identifier sent to the server
    pub incremental: String,
}

impl Default for DeviceBuild {
    fn default() -> Self {
        Self {
            version: "0".to_string(),
            timestamp: 0,
            incremental: "0".to_string(),
        }
    }
}

/// HTTP client settings for manifest fetches
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HttpSettings {
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            connect_timeout_secs: 10,
            user_agent: format!("otasync/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Updater configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Manifest URL template; `{device}`, `{type}` and `{incr}` are substituted
    pub server_url: String,
    /// Release type to follow
    pub channel: String,
    /// Device codename
    pub device: String,
    /// Installed build
    pub build: DeviceBuild,
    /// Whether periodic checks are enabled
    pub auto_check: bool,
    /// Periodic check interval
    pub check_interval: CheckInterval,
    /// Delay before the one-shot retry after a failed check
    pub retry_delay_secs: u64,
    /// Offer builds older than the installed one
    pub allow_downgrades: bool,
    /// Directory holding the committed manifest and check history
    pub cache_dir: PathBuf,
    /// Directory receiving imported packages
    pub downloads_dir: PathBuf,
    /// HTTP settings
    pub http: HttpSettings,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            server_url: "https://updates.example.com/api/v1/{device}/{type}/{incr}".to_string(),
            channel: "nightly".to_string(),
            device: "generic".to_string(),
            build: DeviceBuild::default(),
            auto_check: true,
            check_interval: CheckInterval::Daily,
            retry_delay_secs: 60 * 60,
            allow_downgrades: false,
            cache_dir: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("otasync"),
            downloads_dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("otasync")
                .join("downloads"),
            http: HttpSettings::default(),
        }
    }
}

impl UpdaterConfig {
    /// Resolve the manifest URL for this device and channel
    pub fn server_url(&self) -> Result<Url> {
        let resolved = self
            .server_url
            .replace("{device}", &self.device)
            .replace("{type}", &self.channel.to_lowercase())
            .replace("{incr}", &self.build.incremental);
        Url::parse(&resolved).map_err(|e| {
            UpdateError::config(format!("Invalid server URL '{}': {}", resolved, e))
        })
    }

    /// Path of the committed manifest
    pub fn manifest_path(&self) -> PathBuf {
        self.cache_dir.join("updates.json")
    }

    /// Path of the persisted check history
    pub fn history_path(&self) -> PathBuf {
        self.cache_dir.join("history.json")
    }

    /// Path of the index of locally imported packages
    pub fn local_index_path(&self) -> PathBuf {
        self.cache_dir.join("local.json")
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    /// Check values that would make the updater misbehave
    pub fn validate(&self) -> Result<()> {
        if self.device.trim().is_empty() {
            return Err(UpdateError::config("Device must not be empty"));
        }
        if self.channel.trim().is_empty() {
            return Err(UpdateError::config("Channel must not be empty"));
        }
        if self.retry_delay_secs == 0 {
            return Err(UpdateError::config(
                "Retry delay must be greater than 0",
            ));
        }
        self.server_url()?;
        Ok(())
    }
}

/// Loads [`UpdaterConfig`] from file and environment
pub struct ConfigLoader {
    config_path: PathBuf,
    env_prefix: String,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
            env_prefix: ENV_PREFIX.to_string(),
        }
    }

    /// Use a specific config file
    pub fn with_path(path: impl AsRef<Path>) -> Self {
        Self {
            config_path: path.as_ref().to_path_buf(),
            env_prefix: ENV_PREFIX.to_string(),
        }
    }

    /// Override the environment prefix
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("otasync")
            .join("config.toml")
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load and validate the configuration
    pub fn load(&self) -> Result<UpdaterConfig> {
        debug!("Loading configuration from {}", self.config_path.display());

        let settings = Config::builder()
            .add_source(File::from(self.config_path.clone()).required(false))
            .add_source(
                Environment::with_prefix(&self.env_prefix)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let config: UpdaterConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
