//! Application configuration management.
//!
//! This module handles loading and saving the client configuration: backend
//! base URL, last used username, where the session is kept, and refresh
//! timing.
//!
//! Configuration is stored at `~/.config/admissions-portal/config.json`. The
//! `ADMISSIONS_API_URL` environment variable overrides the configured base URL.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::client::{
    ClientConfig, DEFAULT_API_BASE_URL, DEFAULT_REFRESH_MARGIN_SECS, DEFAULT_REQUEST_TIMEOUT_SECS,
};
use crate::auth::{FileStorage, KeyringStorage, SessionStorage};

/// Application name used for config/data directory paths
const APP_NAME: &str = "admissions-portal";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding the backend base URL
pub const API_URL_ENV: &str = "ADMISSIONS_API_URL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// JSON file in the user data directory
    #[default]
    File,
    /// OS keychain
    Keyring,
}

fn default_refresh_margin_secs() -> i64 {
    DEFAULT_REFRESH_MARGIN_SECS
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub last_username: Option<String>,
    #[serde(default)]
    pub storage: StorageBackend,
    #[serde(default = "default_refresh_margin_secs")]
    pub refresh_margin_secs: i64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: None,
            last_username: None,
            storage: StorageBackend::default(),
            refresh_margin_secs: DEFAULT_REFRESH_MARGIN_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    /// Base URL from the environment, then this config, then the default.
    pub fn api_base_url(&self) -> String {
        resolve_base_url(std::env::var(API_URL_ENV).ok(), self.api_base_url.as_deref())
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::new(self.api_base_url())
            .refresh_margin(chrono::Duration::seconds(self.refresh_margin_secs.max(0)))
            .timeout(std::time::Duration::from_secs(self.request_timeout_secs))
    }

    pub fn session_storage(&self) -> Result<Arc<dyn SessionStorage>> {
        Ok(match self.storage {
            StorageBackend::File => Arc::new(FileStorage::new(self.data_dir()?)),
            StorageBackend::Keyring => Arc::new(KeyringStorage::new()),
        })
    }
}

fn resolve_base_url(env: Option<String>, configured: Option<&str>) -> String {
    env.as_deref()
        .into_iter()
        .chain(configured)
        .map(str::trim)
        .find(|url| !url.is_empty())
        .unwrap_or(DEFAULT_API_BASE_URL)
        .trim_end_matches('/')
        .to_string()
}
