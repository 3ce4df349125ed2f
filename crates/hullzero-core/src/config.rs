//! Application configuration management.
//!
//! This module handles loading and saving the client configuration: the
//! API base URL, request timeout and which secret store backend to use.
//!
//! Configuration is stored at `~/.config/hullzero/config.json`; the
//! `HULLZERO_API_URL` and `HULLZERO_STORAGE` environment variables
//! override the file.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::api::{ApiClient, DEFAULT_TIMEOUT_SECS};
use crate::auth::{FileStore, KeyringStore, MemoryStore, SecretStore};

/// Application name used for config/data directory paths
const APP_NAME: &str = "hullzero";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_API_URL: &str = "http://localhost:8000";

const ENV_API_URL: &str = "HULLZERO_API_URL";
const ENV_STORAGE: &str = "HULLZERO_STORAGE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Keyring,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "file" => Ok(StorageBackend::File),
            "keyring" | "keychain" => Ok(StorageBackend::Keyring),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(anyhow::anyhow!("Unknown storage backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_url: String,
    pub request_timeout_secs: u64,
    pub storage: StorageBackend,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
            storage: StorageBackend::default(),
        }
    }
}

impl Config {
    /// Load the config file (defaults if absent) and apply env overrides
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_API_URL).filter(|u| !u.trim().is_empty()) {
            self.api_url = url.trim().to_string();
        }
        if let Some(raw) = lookup(ENV_STORAGE) {
            match raw.parse() {
                Ok(backend) => self.storage = backend,
                Err(e) => warn!(error = %e, "Ignoring {}", ENV_STORAGE),
            }
        }
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory for the session file and logs
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn api_client(&self) -> Result<ApiClient> {
        ApiClient::new(&self.api_url, self.request_timeout())
    }

    pub fn secret_store(&self) -> Result<Arc<dyn SecretStore>> {
        Ok(match self.storage {
            StorageBackend::File => Arc::new(FileStore::new(&self.data_dir()?)),
            StorageBackend::Keyring => Arc::new(KeyringStore::new()),
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
        })
    }
}
