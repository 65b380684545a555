//! Configuration Management Module
//!
//! JSON configuration files for the coordinator, the client and the agent.
//! Files live under `<config_dir>/homechannel/` unless a path is given.

pub mod types;

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::info;

pub use types::{AgentConfig, ClientConfig, CoordinatorConfig};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed configuration in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// `<config_dir>/homechannel`
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("homechannel"))
}

/// Default location of a named configuration file.
pub fn default_path(name: &str) -> Option<PathBuf> {
    config_dir().map(|d| d.join(format!("{}.json", name)))
}

/// Load a JSON configuration file.
///
/// With an explicit path the file must exist. Without one, the default
/// location is tried and a missing file yields `T::default()`.
pub fn load_json<T>(explicit: Option<&Path>, name: &str) -> Result<T, ConfigError>
where
    T: DeserializeOwned + Default,
{
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => match default_path(name) {
            Some(p) if p.exists() => p,
            _ => {
                info!("[config] no {} config found, using defaults", name);
                return Ok(T::default());
            }
        },
    };

    let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    let parsed = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.clone(),
        source,
    })?;
    info!("[config] loaded {} config from {:?}", name, path);
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_explicit_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("coordinator.json");
        std::fs::write(&path, r#"{"maxServers": 7, "sessionTtlSecs": 90}"#).unwrap();

        let config: CoordinatorConfig = load_json(Some(&path), "coordinator").unwrap();
        assert_eq!(config.max_servers, 7);
        assert_eq!(config.session_ttl_secs, 90);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nope.json");
        let result: Result<CoordinatorConfig, _> = load_json(Some(&path), "coordinator");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ nope").unwrap();
        let result: Result<ClientConfig, _> = load_json(Some(&path), "client");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }
}
