//! Configuration module for the packetlog service.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the service
#[derive(Parser, Debug)]
#[command(name = "packetlog")]
#[command(version = "0.1.0")]
#[command(about = "Appends newline-terminated packets to a shared log and replays it", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:9000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Path of the shared log file
    #[arg(short = 'f', long)]
    pub log_file: Option<PathBuf>,

    /// Seconds between timestamp records
    #[arg(short = 't', long)]
    pub timestamp_interval: Option<u64>,

    /// Maximum number of live workers
    #[arg(short = 'w', long)]
    pub max_workers: Option<usize>,

    /// Detach from the controlling terminal after binding
    #[arg(short = 'd', long)]
    pub daemon: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and worker configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Pending connection queue length
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Upper bound on registered workers
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Bytes read from a socket per cycle
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            max_workers: default_max_workers(),
            chunk_size: default_chunk_size(),
        }
    }
}

/// Shared log configuration
#[derive(Debug, Deserialize)]
pub struct LogConfig {
    /// Location of the persisted log
    #[serde(default = "default_log_path")]
    pub path: PathBuf,
    /// Seconds between timestamp records
    #[serde(default = "default_timestamp_interval")]
    pub timestamp_interval: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: default_log_path(),
            timestamp_interval: default_timestamp_interval(),
        }
    }
}

/// Diagnostics configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_backlog() -> i32 {
    128
}

fn default_max_workers() -> usize {
    1024
}

fn default_chunk_size() -> usize {
    1024
}

fn default_log_path() -> PathBuf {
    PathBuf::from("/var/tmp/aesdsocketdata")
}

fn default_timestamp_interval() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub backlog: i32,
    pub max_workers: usize,
    pub chunk_size: usize,
    pub log_path: PathBuf,
    pub timestamp_interval: u64,
    pub daemon: bool,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            backlog: toml_config.server.backlog,
            max_workers: cli.max_workers.unwrap_or(toml_config.server.max_workers),
            chunk_size: toml_config.server.chunk_size,
            log_path: cli.log_file.unwrap_or(toml_config.log.path),
            timestamp_interval: cli
                .timestamp_interval
                .unwrap_or(toml_config.log.timestamp_interval),
            daemon: cli.daemon,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.timestamp_interval == 0 {
            return Err(ConfigError::Invalid("timestamp_interval must be at least 1 second"));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be non-zero"));
        }
        // The timestamp writer occupies one slot.
        if self.max_workers < 2 {
            return Err(ConfigError::Invalid("max_workers must be at least 2"));
        }
        Ok(())
    }

    pub fn timestamp_period(&self) -> Duration {
        Duration::from_secs(self.timestamp_interval)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {1}", path = .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{path}': {1}", path = .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
