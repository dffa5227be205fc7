//! Configuration loading from `~/.fleetlink/config.toml` with defaults.

use fleetlink_types::config::HubConfig;
use fleetlink_types::error::FleetError;
use std::path::{Path, PathBuf};
use tracing::info;

/// Why a config file could not be used.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

impl From<ConfigError> for FleetError {
    fn from(e: ConfigError) -> Self {
        FleetError::Config(e.to_string())
    }
}

/// Load hub configuration, falling back to defaults.
///
/// A missing, unreadable or malformed file logs a warning and yields
/// [`HubConfig::default`]. Validation problems are not checked here.
pub fn load_config(path: Option<&Path>) -> HubConfig {
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    match try_load_config(&config_path) {
        Ok(config) => {
            info!(path = %config_path.display(), peers = config.peers.len(), "Loaded configuration");
            config
        }
        Err(ConfigError::NotFound(_)) => {
            info!(path = %config_path.display(), "Config file not found, using defaults");
            HubConfig::default()
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to load config, using defaults"
            );
            HubConfig::default()
        }
    }
}

/// Read and deserialize `path` without any fallback.
pub fn try_load_config(path: &Path) -> Result<HubConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load `path` strictly and run [`HubConfig::validate`] on the result.
pub fn check_config(path: &Path) -> Result<HubConfig, ConfigError> {
    let config = try_load_config(path)?;
    let problems = config.validate();
    if problems.is_empty() {
        Ok(config)
    } else {
        Err(ConfigError::Invalid(problems))
    }
}

/// `~/.fleetlink/config.toml`.
pub fn default_config_path() -> PathBuf {
    fleetlink_home().join("config.toml")
}

/// The FleetLink home directory.
pub fn fleetlink_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".fleetlink")
}
