//! Configuration module
//!
//! Handles loading and saving netplay configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::network::NetworkConfig;
use crate::protocol::{MessageRegistry, DEFAULT_POOL_CAPACITY};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Message registry settings
    #[serde(default)]
    pub registry: RegistryConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Name shown to other participants
    pub name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
    /// Log file path (optional)
    pub log_file: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            verbose: false,
            log_file: None,
        }
    }
}

/// Message registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Idle decoded messages kept per type, 0 disables pooling
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
}

fn default_pool_capacity() -> usize {
    DEFAULT_POOL_CAPACITY
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            pool_capacity: default_pool_capacity(),
        }
    }
}

impl RegistryConfig {
    /// Create an empty registry with this pool capacity
    pub fn build<C: Send + Sync + 'static>(&self) -> MessageRegistry<C> {
        MessageRegistry::with_pool_capacity(self.pool_capacity)
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("netplay/config.toml")),
            Some(PathBuf::from("./netplay.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                tracing::debug!("Loading configuration from {}", path.display());
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            name: "player-one".to_string(),
            verbose: false,
            log_file: None,
        },
        network: NetworkConfig {
            bind_address: "127.0.0.1".to_string(),
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DEFAULT_PORT;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.port, DEFAULT_PORT);
        assert_eq!(config.registry.pool_capacity, DEFAULT_POOL_CAPACITY);
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.network.port = 31337;
        config.registry.pool_capacity = 4;
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.network.port, 31337);
        assert_eq!(loaded.registry.pool_capacity, 4);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[network]\nport = 4000\n\n[general]\nname = \"bob\"").unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.network.port, 4000);
        assert_eq!(loaded.network.connect_timeout_ms, 5000);
        assert_eq!(loaded.general.name, "bob");
        assert!(!loaded.general.verbose);
        assert_eq!(loaded.registry.pool_capacity, DEFAULT_POOL_CAPACITY);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.general.name, "player-one");
        assert_eq!(parsed.network.bind_address, "127.0.0.1");
    }
}
