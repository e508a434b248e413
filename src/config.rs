//! Environment-driven configuration

use std::path::PathBuf;

use crate::upload::types::{
    DEFAULT_MAX_CHUNK_BYTES, DEFAULT_SESSION_TTL_HOURS, DEFAULT_SWEEP_INTERVAL_SECS,
};

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value}")]
    Invalid { var: String, value: String },
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,

    /// Maximum accepted chunk body size in bytes
    pub max_chunk_bytes: usize,
}

/// Upload storage configuration
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Root directory for chunk and final artifacts
    pub dir: PathBuf,

    /// Idle session expiry in hours
    pub session_ttl_hours: i64,

    /// Background sweep interval in seconds
    pub sweep_interval_secs: u64,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub upload: UploadConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                port: 3000,
                max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            },
            upload: UploadConfig {
                dir: PathBuf::from("./data/uploads"),
                session_ttl_hours: DEFAULT_SESSION_TTL_HOURS,
                sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            },
        }
    }
}

impl Config {
    /// Load configuration from environment variables, using defaults for
    /// anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        Ok(Self {
            server: ServerConfig {
                port: parse_var("UPDROP_PORT", defaults.server.port)?,
                max_chunk_bytes: parse_var(
                    "UPDROP_MAX_CHUNK_BYTES",
                    defaults.server.max_chunk_bytes,
                )?,
            },
            upload: UploadConfig {
                dir: std::env::var("UPDROP_UPLOAD_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.upload.dir),
                session_ttl_hours: parse_var(
                    "UPDROP_SESSION_TTL_HOURS",
                    defaults.upload.session_ttl_hours,
                )?,
                sweep_interval_secs: parse_var(
                    "UPDROP_SWEEP_INTERVAL_SECS",
                    defaults.upload.sweep_interval_secs,
                )?,
            },
        })
    }
}

fn parse_var<T: std::str::FromStr>(var: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value.parse().map_err(|_| ConfigError::Invalid {
            var: var.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}
