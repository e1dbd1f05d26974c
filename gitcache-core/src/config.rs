//! Configuration management for gitcache
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. CLI flags
//! 2. Environment variables (GITCACHE_*)
//! 3. Config file (~/.config/gitcache/config.toml)
//! 4. Default values

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Where cloned repositories live
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root directory for clones (defaults to `~/.cache/gitcache/repos`)
    pub root: Option<PathBuf>,
}

/// Git-related configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GitConfig {
    /// Name of the remote every clone tracks
    pub remote: String,

    /// Deadline for a single clone/fetch/push transfer
    #[serde(with = "humantime_serde")]
    pub network_timeout: Duration,

    /// Upper bound for a whole read/write/list operation
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Duration,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            network_timeout: Duration::from_secs(120),
            operation_timeout: Duration::from_secs(300),
        }
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Cache configuration
    pub cache: CacheConfig,

    /// Git configuration
    pub git: GitConfig,
}

impl Config {
    /// Load configuration from the default config file location
    ///
    /// Returns default config if file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();

        if let Some(path) = config_path {
            if path.exists() {
                return Self::load_from_file(&path);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::storage(format!("Failed to read {}", path.display()), e))?;
        toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Get the default config file path
    ///
    /// Returns `~/.config/gitcache/config.toml` on Unix
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("gitcache").join("config.toml"))
    }

    /// Get the default clone root
    ///
    /// Returns `~/.cache/gitcache/repos`
    pub fn default_cache_root() -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| Error::Config("Could not determine cache directory".to_string()))?;

        Ok(cache_dir.join("gitcache").join("repos"))
    }

    /// Resolved clone root
    pub fn cache_root(&self) -> Result<PathBuf> {
        match &self.cache.root {
            Some(root) => Ok(root.clone()),
            None => Self::default_cache_root(),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported variables:
    /// - GITCACHE_CACHE_DIR: Clone root
    /// - GITCACHE_REMOTE: Remote name
    /// - GITCACHE_NETWORK_TIMEOUT: Transfer deadline (e.g. "90s")
    /// - GITCACHE_OPERATION_TIMEOUT: Operation timeout (e.g. "10m")
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(root) = std::env::var("GITCACHE_CACHE_DIR") {
            self.cache.root = Some(PathBuf::from(root));
        }

        if let Ok(remote) = std::env::var("GITCACHE_REMOTE") {
            self.git.remote = remote;
        }

        if let Ok(timeout) = std::env::var("GITCACHE_NETWORK_TIMEOUT") {
            self.git.network_timeout = parse_duration("GITCACHE_NETWORK_TIMEOUT", &timeout)?;
        }

        if let Ok(timeout) = std::env::var("GITCACHE_OPERATION_TIMEOUT") {
            self.git.operation_timeout = parse_duration("GITCACHE_OPERATION_TIMEOUT", &timeout)?;
        }

        Ok(self)
    }

    /// Apply CLI flag overrides
    pub fn with_cli_overrides(mut self, cache_dir: Option<PathBuf>) -> Self {
        if let Some(root) = cache_dir {
            self.cache.root = Some(root);
        }

        self
    }

    /// Load configuration with all overrides applied
    ///
    /// Priority: CLI > env > config file > defaults
    pub fn load_with_overrides(cache_dir: Option<PathBuf>) -> Result<Self> {
        Ok(Self::load()?
            .with_env_overrides()?
            .with_cli_overrides(cache_dir))
    }
}

fn parse_duration(var: &str, value: &str) -> Result<Duration> {
    humantime_serde::re::humantime::parse_duration(value.trim())
        .map_err(|e| Error::Config(format!("Invalid duration in {}: {}", var, e)))
}
