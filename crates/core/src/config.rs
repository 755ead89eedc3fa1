//! Application Configuration
//!
//! Manages devlink settings including:
//! - Android SDK and AVD paths
//! - Device readiness polling and timeouts
//! - Readiness probe commands

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{DevlinkError, Result};

/// Android SDK configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AndroidConfig {
    /// Path to Android SDK
    pub sdk_path: Option<PathBuf>,
    /// Directory holding `<name>.ini` / `<name>.avd` pairs
    pub avd_home: Option<PathBuf>,
}

impl AndroidConfig {
    /// Get Android SDK path, with auto-detection
    pub fn resolve_sdk_path(&self) -> Option<PathBuf> {
        self.sdk_path.clone().or_else(|| {
            if let Some(path) = std::env::var_os("ANDROID_HOME").map(PathBuf::from) {
                if path.exists() {
                    return Some(path);
                }
            }

            let candidates = if cfg!(windows) {
                vec![
                    dirs::config_local_dir().map(|d| d.join("Android").join("Sdk")),
                    Some(PathBuf::from("C:\\Android\\sdk")),
                ]
            } else {
                vec![
                    dirs::home_dir().map(|h: PathBuf| h.join("Android").join("Sdk")),
                    Some(PathBuf::from("/usr/local/android-sdk")),
                ]
            };

            candidates.into_iter().flatten().find(|p: &PathBuf| p.exists())
        })
    }

    /// Get the AVD home directory (`~/.android/avd` unless overridden)
    pub fn resolve_avd_home(&self) -> PathBuf {
        self.avd_home.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".android")
                .join("avd")
        })
    }
}

/// Device lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Interval between readiness polls in milliseconds
    pub poll_interval_ms: u64,
    /// Maximum time a device may take to become ready, in milliseconds
    pub max_start_time_ms: u64,
    /// Timeout for a single readiness probe command
    pub shell_timeout_ms: u64,
    /// Default timeout for a batch file transfer
    pub transfer_timeout_ms: u64,
    /// Interval at which the adb watcher re-enumerates devices
    pub bridge_poll_interval_ms: u64,
    /// Property that reads "1" once boot has completed
    pub boot_completed_property: String,
    /// Shell command used to check that the package manager answers
    pub package_manager_probe: String,
    /// Text the package manager probe must print
    pub package_manager_ready_marker: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            max_start_time_ms: 180_000,
            shell_timeout_ms: 5_000,
            transfer_timeout_ms: 60_000,
            bridge_poll_interval_ms: 1_000,
            boot_completed_property: "sys.boot_completed".to_string(),
            package_manager_probe: "pm get-max-users".to_string(),
            package_manager_ready_marker: "Maximum supported users".to_string(),
        }
    }
}

impl DeviceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn max_start_time(&self) -> Duration {
        Duration::from_millis(self.max_start_time_ms)
    }

    pub fn shell_timeout(&self) -> Duration {
        Duration::from_millis(self.shell_timeout_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn bridge_poll_interval(&self) -> Duration {
        Duration::from_millis(self.bridge_poll_interval_ms.max(1))
    }

    /// Number of readiness polls allowed before a device is failed.
    ///
    /// Rounds up, and is never zero, so a device that never becomes ready
    /// is failed after a bounded number of polls.
    pub fn max_poll_ticks(&self) -> u64 {
        let interval = self.poll_interval_ms.max(1);
        self.max_start_time_ms.div_ceil(interval).max(1)
    }
}

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Configuration version for migrations
    pub version: u32,
    /// Android SDK settings
    pub android: AndroidConfig,
    /// Device lifecycle settings
    pub devices: DeviceConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: 1,
            android: AndroidConfig::default(),
            devices: DeviceConfig::default(),
        }
    }
}

impl AppConfig {
    /// Get the configuration directory path
    pub fn config_dir() -> Option<PathBuf> {
        ProjectDirs::from("dev", "devlink", "devlink").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the configuration file path
    pub fn config_file() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Load configuration from the default location
    pub async fn load() -> Result<Self> {
        let config_file = Self::config_file()
            .ok_or_else(|| DevlinkError::Config("Cannot determine config path".into()))?;
        Self::load_from(&config_file).await
    }

    /// Load configuration from a file, falling back to defaults when absent
    pub async fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            debug!("Loading config from {:?}", path);
            let contents = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&contents)?;
            Ok(config)
        } else {
            info!("Config file {:?} not found, using defaults", path);
            Ok(AppConfig::default())
        }
    }

    /// Save configuration to the default location
    pub async fn save(&self) -> Result<()> {
        let config_file = Self::config_file()
            .ok_or_else(|| DevlinkError::Config("Cannot determine config path".into()))?;
        self.save_to(&config_file).await
    }

    /// Save configuration to a file
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let contents = toml::to_string_pretty(self)?;
        tokio::fs::write(path, contents).await?;

        debug!("Config saved to {:?}", path);
        Ok(())
    }
}
