//! Configuration for the file-sharing client
//!
//! Handles config file loading, defaults and validation.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Root of the persisted state tree
    pub state_dir: PathBuf,
    /// Name of this client; state lives under `state_dir/client_name`
    pub client_name: String,
    /// Persist operations so they can be resumed after a restart
    pub persistence: bool,
    /// Probe search results for availability
    pub do_probes: bool,
    /// Ceiling on concurrently running download jobs
    pub max_parallel_downloads: u32,
    /// Ceiling on the summed block cost of running jobs
    pub max_parallel_requests: u32,
    /// Initial estimate of the time to fetch one block
    pub avg_block_latency_ms: u64,
    /// Refine the block latency estimate from observed block arrivals
    pub track_block_latency: bool,
    /// How long to wait for the service to accept an index request
    pub index_start_timeout_ms: u64,
    /// Delay before reconnecting after the service dropped a connection
    pub reconnect_delay_ms: u64,
    /// Peer identity used to sign location URIs (created on demand)
    pub peer_key_file: Option<PathBuf>,
}

impl Default for FsConfig {
    fn default() -> Self {
        FsConfig {
            state_dir: PathBuf::from("./gnfs-state"),
            client_name: "gnfs".to_string(),
            persistence: true,
            do_probes: true,
            max_parallel_downloads: 16,
            max_parallel_requests: 1024 * 10,
            avg_block_latency_ms: 60_000,
            track_block_latency: false,
            index_start_timeout_ms: 30_000,
            reconnect_delay_ms: 1000,
            peer_key_file: None,
        }
    }
}

impl FsConfig {
    /// Load config from a TOML file; missing keys keep their defaults
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: FsConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel_downloads == 0 {
            return Err(ConfigError::Invalid(
                "max_parallel_downloads must be positive".into(),
            ));
        }
        if self.max_parallel_requests == 0 {
            return Err(ConfigError::Invalid(
                "max_parallel_requests must be positive".into(),
            ));
        }
        if self.avg_block_latency_ms == 0 {
            return Err(ConfigError::Invalid(
                "avg_block_latency_ms must be positive".into(),
            ));
        }
        if self.client_name.is_empty() || self.client_name.contains(['/', '\\']) {
            return Err(ConfigError::Invalid(format!(
                "client_name `{}' is not a valid directory name",
                self.client_name
            )));
        }
        Ok(())
    }

    /// Directory holding this client's persisted state
    pub fn client_dir(&self) -> PathBuf {
        self.state_dir.join(&self.client_name)
    }

    pub fn avg_block_latency(&self) -> Duration {
        Duration::from_millis(self.avg_block_latency_ms)
    }

    pub fn index_start_timeout(&self) -> Duration {
        Duration::from_millis(self.index_start_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FsConfig::default();
        assert_eq!(config.state_dir, PathBuf::from("./gnfs-state"));
        assert_eq!(config.max_parallel_downloads, 16);
        assert_eq!(config.max_parallel_requests, 10240);
        assert_eq!(config.avg_block_latency(), Duration::from_secs(60));
        assert!(config.persistence);
        assert!(config.validate().is_ok());
        assert_eq!(config.client_dir(), PathBuf::from("./gnfs-state/gnfs"));
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gnfs.toml");
        std::fs::write(
            &path,
            "state_dir = \"/tmp/x\"\nmax_parallel_downloads = 2\ndo_probes = false\n",
        )
        .unwrap();
        let config = FsConfig::load_from_file(&path).unwrap();
        assert_eq!(config.state_dir, PathBuf::from("/tmp/x"));
        assert_eq!(config.max_parallel_downloads, 2);
        assert!(!config.do_probes);
        assert_eq!(config.client_name, "gnfs");
    }

    #[test]
    fn test_invalid_config() {
        let config = FsConfig {
            max_parallel_requests: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "max_parallel_downloads = \"many\"").unwrap();
        assert!(matches!(
            FsConfig::load_from_file(&path),
            Err(ConfigError::Toml(_))
        ));
    }
}
