//! AVD (Android Virtual Device) Catalog
//!
//! Reads AVD definitions from the AVD home directory so emulator profiles
//! can be created with their target and API level before they ever boot.

use std::path::{Path, PathBuf};

use configparser::ini::Ini;
use tracing::{debug, warn};

use crate::device::ProfileDetails;

/// AVD catalog errors
#[derive(Debug, thiserror::Error)]
pub enum AvdError {
    #[error("AVD not found: {0}")]
    NotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(String),
}

/// AVD information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvdInfo {
    pub name: String,
    pub path: PathBuf,
    pub display_name: Option<String>,
    /// Platform identifier, e.g. "android-34"
    pub target: Option<String>,
    pub api_level: Option<u32>,
    pub abi: Option<String>,
}

impl AvdInfo {
    /// Profile metadata derived from this AVD
    pub fn profile_details(&self) -> ProfileDetails {
        ProfileDetails {
            display_name: self
                .display_name
                .clone()
                .unwrap_or_else(|| self.name.replace('_', " ")),
            target_hash: self.target.clone(),
            api_level: self.api_level,
        }
    }
}

/// Reads `<avd_home>/<name>.ini` and the matching `config.ini`
pub struct AvdCatalog {
    avd_home: PathBuf,
}

impl AvdCatalog {
    pub fn new(avd_home: PathBuf) -> Self {
        Self { avd_home }
    }

    pub fn avd_home(&self) -> &Path {
        &self.avd_home
    }

    /// List all available AVDs
    pub async fn list_avds(&self) -> Result<Vec<AvdInfo>, AvdError> {
        let mut avds = Vec::new();

        if !self.avd_home.exists() {
            debug!("AVD home {:?} does not exist", self.avd_home);
            return Ok(avds);
        }

        let mut entries = tokio::fs::read_dir(&self.avd_home).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();

            if path.extension().map(|e| e == "ini").unwrap_or(false) {
                if let Some(name) = path.file_stem().and_then(|s| s.to_str()) {
                    match self.parse_avd_info(name, &path).await {
                        Ok(info) => avds.push(info),
                        Err(e) => warn!("Skipping AVD {}: {}", name, e),
                    }
                }
            }
        }

        avds.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(avds)
    }

    /// Look up a single AVD by name
    pub async fn find(&self, name: &str) -> Result<AvdInfo, AvdError> {
        let ini_path = self.avd_home.join(format!("{}.ini", name));
        if !ini_path.exists() {
            return Err(AvdError::NotFound(name.to_string()));
        }
        self.parse_avd_info(name, &ini_path).await
    }

    /// Parse AVD info from ini files
    async fn parse_avd_info(&self, name: &str, ini_path: &Path) -> Result<AvdInfo, AvdError> {
        let content = tokio::fs::read_to_string(ini_path).await?;
        let mut ini = Ini::new();
        ini.read(content).map_err(AvdError::Parse)?;

        let path_str = ini.get("default", "path").unwrap_or_default();
        let avd_path = if path_str.is_empty() {
            self.avd_home.join(format!("{}.avd", name))
        } else {
            PathBuf::from(path_str)
        };

        let mut target = ini.get("default", "target");
        let mut display_name = None;
        let mut abi = None;
        let mut sysdir = None;

        let config_path = avd_path.join("config.ini");
        if config_path.exists() {
            let config_content = tokio::fs::read_to_string(&config_path).await?;
            let mut config = Ini::new();
            config.read(config_content).map_err(AvdError::Parse)?;

            display_name = config.get("default", "avd.ini.displayname");
            abi = config.get("default", "abi.type");
            sysdir = config.get("default", "image.sysdir.1");
            if target.is_none() {
                target = config.get("default", "target");
            }
        }

        let api_level = target
            .as_deref()
            .and_then(api_level_from_target)
            .or_else(|| sysdir.as_deref().and_then(api_level_from_sysdir));

        Ok(AvdInfo {
            name: name.to_string(),
            path: avd_path,
            display_name,
            target,
            api_level,
            abi,
        })
    }
}

/// "android-34" or "Google Inc.:Google APIs:34" → 34
pub fn api_level_from_target(target: &str) -> Option<u32> {
    target
        .strip_prefix("android-")
        .or_else(|| target.rsplit(':').next())
        .and_then(|s| s.trim().parse().ok())
}

/// "system-images/android-34/google_apis/x86_64/" → 34
pub fn api_level_from_sysdir(sysdir: &str) -> Option<u32> {
    sysdir
        .split(['/', '\\'])
        .find_map(|part| part.strip_prefix("android-"))
        .and_then(|s| s.parse().ok())
}
