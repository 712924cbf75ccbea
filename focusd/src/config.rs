use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

const DEFAULT_CONFIG_PATH: &str = "focusd.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration file at {path}")]
    FileNotFound { path: PathBuf },
    #[error("failed to read the configuration file: {source}")]
    Read { source: std::io::Error },
    #[error("failed to parse the configuration file: {source}")]
    Parse { source: toml::de::Error },
    #[error("failed to serialize the configuration: {source}")]
    Serialize { source: toml::ser::Error },
    #[error("failed to write the configuration file: {source}")]
    Write { source: std::io::Error },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Address the daemon listens on for clients.
    pub bind_address: SocketAddr,
    /// Serial device of the focuser, or "simulated" for the software device.
    pub serial_port: String,
    /// Hosts allowed to issue mutating commands. Status is open to everyone.
    pub control_ips: Vec<IpAddr>,
    pub idle_poll_delay_ms: u64,
    pub moving_poll_delay_ms: u64,
    pub move_timeout_s: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 9870)),
            serial_port: "simulated".to_string(),
            control_ips: vec![IpAddr::from([127, 0, 0, 1])],
            idle_poll_delay_ms: 5000,
            moving_poll_delay_ms: 500,
            move_timeout_s: 300,
        }
    }
}

impl Config {
    pub fn idle_poll_delay(&self) -> Duration {
        Duration::from_millis(self.idle_poll_delay_ms)
    }

    pub fn moving_poll_delay(&self) -> Duration {
        Duration::from_millis(self.moving_poll_delay_ms)
    }

    pub fn move_timeout(&self) -> Duration {
        Duration::from_secs(self.move_timeout_s)
    }
}

pub fn default_config_path() -> PathBuf {
    std::env::var("CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&default_config_path())
}

pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read { source })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse { source })
}

/// Write a default configuration to `path`, or to the usual location when no
/// path is given.
pub fn create_default_config(path: Option<&Path>) -> Result<(), ConfigError> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);
    let contents = toml::to_string_pretty(&Config::default())
        .map_err(|source| ConfigError::Serialize { source })?;
    fs::write(&path, contents).map_err(|source| ConfigError::Write { source })?;
    info!("wrote a default configuration to {}", path.display());
    Ok(())
}
