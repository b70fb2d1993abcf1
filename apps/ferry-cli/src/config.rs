//! CLI configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/ferry/ferry.toml`
//! - Windows: `%APPDATA%/ferry/ferry.toml`

use std::path::{Path, PathBuf};

use ferry_engine::TransferConfig;
use serde::{Deserialize, Serialize};

/// CLI configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory that backs the object store.
    #[serde(default = "default_bucket_dir")]
    pub bucket_dir: PathBuf,

    /// Log filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Read back and compare every written chunk.
    #[serde(default)]
    pub verify_checksums: bool,

    /// Engine tuning.
    #[serde(default)]
    pub transfer: TransferConfig,
}

fn default_bucket_dir() -> PathBuf {
    config_base_dir().join("ferry").join("bucket")
}

fn default_log_filter() -> String {
    "info".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bucket_dir: default_bucket_dir(),
            log_filter: default_log_filter(),
            verify_checksums: false,
            transfer: TransferConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from `path`, or writes and returns the defaults
    /// if the file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Saves the configuration to `path`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Returns the platform-specific configuration file path.
pub fn default_config_path() -> PathBuf {
    config_base_dir().join("ferry").join("ferry.toml")
}

fn config_base_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".config")
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        PathBuf::from("/tmp")
    }
}
