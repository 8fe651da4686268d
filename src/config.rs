// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistent configuration stored as JSON in `~/.bookfetch/config.json`.
//!
//! Every field has a default, so a partial or missing file is fine.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::download::TransferSettings;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Address to bind to (127.0.0.1 keeps the API local).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Directory for finished books; relative paths resolve against the
    /// working directory.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    /// Write granularity of transfers, in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_search_base_url")]
    pub search_base_url: String,
    #[serde(default = "default_mirror_base_url")]
    pub mirror_base_url: String,
    /// Timeout for upstream page requests and transfer connects.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_port() -> u16 {
    5000
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("books")
}

fn default_chunk_size() -> usize {
    crate::download::transfer::DEFAULT_CHUNK_SIZE
}

fn default_user_agent() -> String {
    "Mozilla/5.0".to_string()
}

fn default_search_base_url() -> String {
    "https://annas-archive.org".to_string()
}

fn default_mirror_base_url() -> String {
    "https://libgen.li".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            storage_dir: default_storage_dir(),
            chunk_size: default_chunk_size(),
            user_agent: default_user_agent(),
            search_base_url: default_search_base_url(),
            mirror_base_url: default_mirror_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Transfer settings: configured agent, mirror as referer.
    pub fn transfer_settings(&self) -> TransferSettings {
        TransferSettings {
            chunk_size: self.chunk_size.max(1),
            user_agent: self.user_agent.clone(),
            referer: Some(self.mirror_base_url.clone()),
            timeout: self.request_timeout(),
        }
    }
}

pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    let config_dir = home.join(".bookfetch");
    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create {:?}", config_dir))?;
    }
    Ok(config_dir)
}

pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.json"))
}

pub fn load_config() -> Result<Config> {
    load_config_from(&config_path()?)
}

pub fn save_config(config: &Config) -> Result<()> {
    save_config_to(config, &config_path()?)
}

/// Load from an explicit path; a missing file yields the defaults.
pub fn load_config_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid config file {:?}", path))
}

pub fn save_config_to(config: &Config, path: &Path) -> Result<()> {
    let content = serde_json::to_string_pretty(config)?;
    fs::write(path, content).with_context(|| format!("Failed to write {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.port, 5000);
        assert_eq!(config.chunk_size, 64 * 1024);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"port": 8080, "storage_dir": "/srv/books"}"#).unwrap();

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.storage_dir, PathBuf::from("/srv/books"));
        assert_eq!(config.bind_address, "127.0.0.1");
        assert_eq!(config.mirror_base_url, "https://libgen.li");
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = Config {
            port: 6001,
            user_agent: "bookfetch-test".to_string(),
            ..Config::default()
        };

        save_config_to(&config, &path).unwrap();
        assert_eq!(load_config_from(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(load_config_from(&path).is_err());
    }

    #[test]
    fn test_transfer_settings_use_mirror_referer() {
        let config = Config {
            chunk_size: 0,
            ..Config::default()
        };
        let settings = config.transfer_settings();
        assert_eq!(settings.chunk_size, 1);
        assert_eq!(settings.referer.as_deref(), Some("https://libgen.li"));
        assert_eq!(settings.timeout, Duration::from_secs(30));
    }
}
