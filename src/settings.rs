// src/settings.rs

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::queue::DEFAULT_POOL_SIZE;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// User-adjustable configuration, persisted as JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub download_path: PathBuf,
    pub max_concurrent_downloads: usize,
    pub default_format: String,
    pub auto_download: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_path: default_download_dir(),
            max_concurrent_downloads: DEFAULT_POOL_SIZE,
            default_format: String::from("best"),
            auto_download: false,
        }
    }
}

impl Settings {
    fn normalized(mut self) -> Self {
        self.max_concurrent_downloads = self.max_concurrent_downloads.max(1);
        self
    }
}

/// `<user download dir>/MediaDownloader`, falling back to `~/Downloads`.
pub fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("downloads"))
        .join("MediaDownloader")
}

/// Reads and writes [`Settings`] at a fixed file location.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `settings.json` inside the default download directory.
    pub fn default_location() -> Self {
        Self::new(default_download_dir().join("settings.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads settings. A missing or unreadable file yields the defaults.
    pub async fn load(&self) -> Settings {
        match self.try_load().await {
            Ok(Some(settings)) => settings.normalized(),
            Ok(None) => Settings::default(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "using default settings: {e}");
                Settings::default()
            }
        }
    }

    async fn try_load(&self) -> Result<Option<Settings>, SettingsError> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&data)?))
    }

    /// Writes settings as pretty JSON, creating the parent directory.
    pub async fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_vec_pretty(settings)?;
        tokio::fs::write(&self.path, data).await?;
        tracing::info!(path = %self.path.display(), "settings saved");
        Ok(())
    }
}
