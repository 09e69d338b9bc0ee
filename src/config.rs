use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::update::version::CURRENT_VERSION;

const DEFAULT_VERSION_URL: &str =
    "https://raw.githubusercontent.com/Hejazimohamed/ocr-update_final/main/version.json";
const DEFAULT_BUNDLE_URL: &str =
    "https://github.com/Hejazimohamed/ocr-update_final/releases/latest/download/update_temp.zip";

/// Read-only view of the application's boolean settings
pub trait Settings: Send + Sync {
    fn get_bool(&self, key: &str) -> bool;
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_version_url")]
    pub version_url: String,

    #[serde(default = "default_bundle_url")]
    pub bundle_url: String,

    /// Directory the bundle is applied to (defaults to the working directory)
    #[serde(default)]
    pub app_dir: Option<PathBuf>,

    /// Version of the installed application (defaults to this build's version)
    #[serde(default)]
    pub current_version: Option<String>,

    #[serde(default = "default_metadata_timeout")]
    pub metadata_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Upper bound for the whole bundle download
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,

    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Allow periodic background checks
    #[serde(default = "default_true")]
    pub auto_update: bool,

    /// Append update outcomes to update_reports.log
    #[serde(default)]
    pub send_reports: bool,
}

fn default_version_url() -> String {
    DEFAULT_VERSION_URL.to_string()
}

fn default_bundle_url() -> String {
    DEFAULT_BUNDLE_URL.to_string()
}

fn default_metadata_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_download_timeout() -> u64 {
    600
}

fn default_check_interval() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version_url: default_version_url(),
            bundle_url: default_bundle_url(),
            app_dir: None,
            current_version: None,
            metadata_timeout_secs: default_metadata_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            download_timeout_secs: default_download_timeout(),
            check_interval_secs: default_check_interval(),
            auto_update: true,
            send_reports: false,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Invalid config file {}", config_path.display()))?;
        Ok(config)
    }

    pub fn config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("ocr-update")
            .join("config.toml")
    }

    pub fn app_dir(&self) -> PathBuf {
        self.app_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn current_version(&self) -> String {
        self.current_version
            .clone()
            .unwrap_or_else(|| CURRENT_VERSION.to_string())
    }
}

impl Settings for Config {
    fn get_bool(&self, key: &str) -> bool {
        match key {
            "auto_update" => self.auto_update,
            "send_reports" => self.send_reports,
            _ => false,
        }
    }
}
