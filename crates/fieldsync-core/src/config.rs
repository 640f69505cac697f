//! Application configuration management.
//!
//! Configuration is stored at `~/.config/fieldsync/config.json`. A few
//! fields can be overridden from the environment (or a `.env` file loaded
//! by the binary) so deployments need not write the file at all.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::assets::AssetManifest;
use crate::connectivity::DEFAULT_PROBE_INTERVAL_SECS;

/// Application name used for config/data directory paths
const APP_NAME: &str = "fieldsync";

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const ENV_REMOTE_URL: &str = "FIELDSYNC_REMOTE_URL";
pub const ENV_API_KEY: &str = "FIELDSYNC_API_KEY";
pub const ENV_DATA_DIR: &str = "FIELDSYNC_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Base URL of the remote store's REST endpoint
    pub remote_url: Option<String>,
    pub api_key: Option<String>,
    /// Origin whose static assets are served from the snapshot
    pub app_origin: Option<String>,
    pub asset_version: Option<String>,
    pub asset_manifest: Vec<String>,
    pub probe_interval_secs: Option<u64>,
    pub data_dir: Option<PathBuf>,
}

impl Config {
    /// Load from the default path with environment overrides applied.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Invalid config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Replace fields with any override `lookup` returns. Empty values are
    /// ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let value = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(url) = value(ENV_REMOTE_URL) {
            self.remote_url = Some(url);
        }
        if let Some(key) = value(ENV_API_KEY) {
            self.api_key = Some(key);
        }
        if let Some(dir) = value(ENV_DATA_DIR) {
            self.data_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn remote_url(&self) -> Result<&str> {
        self.remote_url.as_deref().ok_or_else(|| {
            anyhow::anyhow!("No remote_url configured (set {} or edit the config file)", ENV_REMOTE_URL)
        })
    }

    /// Root for the store, snapshots and logs.
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.data_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn store_dir(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("store"))
    }

    pub fn assets_dir(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("assets"))
    }

    pub fn log_dir(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("logs"))
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(
            self.probe_interval_secs
                .filter(|&s| s > 0)
                .unwrap_or(DEFAULT_PROBE_INTERVAL_SECS),
        )
    }

    /// The asset manifest, when a version has been configured.
    pub fn asset_manifest(&self) -> Option<AssetManifest> {
        let version = self.asset_version.clone()?;
        Some(AssetManifest::new(version, self.asset_manifest.clone()))
    }
}
