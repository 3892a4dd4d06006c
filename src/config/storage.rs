//! Configuration Storage
//!
//! Reads forward configuration files from disk.
//! YAML is the default format; files ending in `.json` are parsed as JSON.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::fs;

use super::types::{ConfigFile, CONFIG_VERSION};

/// Default configuration file name, looked up in the working directory first
pub const DEFAULT_CONFIG_FILE: &str = "kubeforward.yml";

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}

/// Get the kubeforward configuration directory
/// Returns <platform config dir>/kubeforward, e.g. ~/.config/kubeforward on Linux
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("kubeforward"))
}

/// Pick the config file to use when none was given explicitly:
/// `./kubeforward.yml` if present, otherwise the one in the config directory.
pub fn default_config_path() -> PathBuf {
    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    if local.exists() {
        return local;
    }
    match config_dir() {
        Some(dir) => {
            let global = dir.join(DEFAULT_CONFIG_FILE);
            if global.exists() {
                global
            } else {
                local
            }
        }
        None => local,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Yaml,
    Json,
}

impl Format {
    fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Format::Json,
            _ => Format::Yaml,
        }
    }
}

#[derive(Deserialize)]
struct VersionProbe {
    #[serde(default)]
    version: u32,
}

/// Configuration storage manager
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Create a storage manager with the default path
    pub fn new() -> Self {
        Self {
            path: default_config_path(),
        }
    }

    /// Create a storage manager with a custom path
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load configuration from disk
    ///
    /// Unlike a settings store there is no sensible default here: a missing
    /// file is an error.
    pub async fn load(&self) -> Result<ConfigFile, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(self.path.clone()))
            }
            Err(e) => return Err(StorageError::Io(e)),
        };

        let config = Self::parse(&contents, Format::for_path(&self.path))?;
        tracing::debug!(
            "Loaded config from {:?} ({} bytes, {} environments)",
            self.path,
            contents.len(),
            config.environments.len()
        );
        Ok(config)
    }

    fn parse(contents: &str, format: Format) -> Result<ConfigFile, StorageError> {
        // Check the version first, newer files may carry keys we reject
        let probe: VersionProbe = Self::deserialize(contents, format)?;
        if probe.version > CONFIG_VERSION {
            return Err(StorageError::VersionTooNew {
                found: probe.version,
                supported: CONFIG_VERSION,
            });
        }
        Self::deserialize(contents, format)
    }

    fn deserialize<T: DeserializeOwned>(contents: &str, format: Format) -> Result<T, StorageError> {
        Ok(match format {
            Format::Yaml => serde_yaml::from_str(contents)?,
            Format::Json => serde_json::from_str(contents)?,
        })
    }

    /// Check if config file exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    /// Get config file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for ConfigStorage {
    fn default() -> Self {
        Self::new()
    }
}
