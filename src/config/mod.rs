//! Configuration module for fpm-probe
//!
//! Handles the optional TOML file that tunes timeouts and the candidate
//! address table used during detection.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::detect::Network;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Detection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Reachability dial timeout in milliseconds
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    /// Read/write timeout for introspection requests in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Deadline for the configuration dump subprocess in seconds
    #[serde(default = "default_dump_timeout_secs")]
    pub dump_timeout_secs: u64,

    /// Substring identifying FPM-family executables
    #[serde(default = "default_process_marker")]
    pub process_marker: String,

    /// Flag appended to the FPM command line to dump its configuration
    #[serde(default = "default_dump_flag")]
    pub dump_flag: String,

    /// Addresses tried when no endpoint is known
    #[serde(default = "default_candidates", rename = "candidate")]
    pub candidates: Vec<Candidate>,

    /// Directory where introspection scripts are staged
    #[serde(default)]
    pub scripts_dir: Option<PathBuf>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            dial_timeout_ms: default_dial_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            dump_timeout_secs: default_dump_timeout_secs(),
            process_marker: default_process_marker(),
            dump_flag: default_dump_flag(),
            candidates: default_candidates(),
            scripts_dir: None,
        }
    }
}

impl ProbeConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    /// Load configuration from a string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let config: ProbeConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dial_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "dial_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.request_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "request_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.dump_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "dump_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.process_marker.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "process_marker must not be empty".to_string(),
            ));
        }

        for candidate in &self.candidates {
            if Network::from_address(&candidate.address) != candidate.network {
                return Err(ConfigError::ValidationError(format!(
                    "candidate {} does not look like a {} address",
                    candidate.address, candidate.network
                )));
            }
        }

        Ok(())
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn dump_timeout(&self) -> Duration {
        Duration::from_secs(self.dump_timeout_secs)
    }
}

/// One entry of the candidate address table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Candidate {
    pub network: Network,
    pub address: String,
}

impl Candidate {
    pub fn new(network: Network, address: impl Into<String>) -> Self {
        Self {
            network,
            address: address.into(),
        }
    }
}

fn default_dial_timeout_ms() -> u64 {
    100
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_dump_timeout_secs() -> u64 {
    10
}

fn default_process_marker() -> String {
    "-fpm".to_string()
}

fn default_dump_flag() -> String {
    "-tt".to_string()
}

/// Conventional FPM locations, unix sockets first
pub fn default_candidates() -> Vec<Candidate> {
    let sockets = [
        "/run/php/php-fpm.sock",
        "/run/php/php7.0-fpm.sock",
        "/run/php/php7.1-fpm.sock",
        "/run/php/php7.2-fpm.sock",
        "/run/php/php70-fpm.sock",
        "/run/php/php71-fpm.sock",
        "/run/php/php72-fpm.sock",
    ];
    let ports = ["localhost:9000", "127.0.0.1:9000"];

    sockets
        .iter()
        .map(|path| Candidate::new(Network::Unix, *path))
        .chain(ports.iter().map(|addr| Candidate::new(Network::Tcp, *addr)))
        .collect()
}
