//! Configuration module for the sockconsole binary.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::client::ClientOptions;
use crate::server::ServerConfig;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "sockconsole")]
#[command(version = "0.1.0")]
#[command(about = "Interactive line consoles for remote peers over TCP", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: CliCommand,
}

/// What the binary should do
#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Accept peers and drive their consoles from stdin
    Serve {
        /// Address to bind to (e.g., 127.0.0.1:10111)
        #[arg(short = 'l', long)]
        listen: Option<String>,

        /// Maximum number of connected peers
        #[arg(short = 'm', long)]
        max_connections: Option<usize>,

        /// Listen backlog
        #[arg(long)]
        backlog: Option<i32>,

        /// Seconds between sweeps for dead connections
        #[arg(long)]
        clean_interval: Option<u64>,
    },
    /// Connect to a server and act as its remote terminal
    Connect {
        /// Server address (host:port)
        address: String,
    },
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerTable,
    #[serde(default)]
    pub connection: ConnectionTable,
    #[serde(default)]
    pub logging: LoggingTable,
}

/// `[server]` table
#[derive(Debug, Deserialize)]
pub struct ServerTable {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Maximum number of connected peers
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Seconds between sweeps for dead connections
    #[serde(default = "default_clean_interval")]
    pub clean_interval_secs: u64,
}

impl Default for ServerTable {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            clean_interval_secs: default_clean_interval(),
        }
    }
}

/// `[connection]` table
#[derive(Debug, Deserialize)]
pub struct ConnectionTable {
    /// Longest accepted line in bytes
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self {
            max_line_length: default_max_line_length(),
        }
    }
}

/// `[logging]` table
#[derive(Debug, Deserialize)]
pub struct LoggingTable {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingTable {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:10111".to_string()
}

fn default_backlog() -> i32 {
    5
}

fn default_max_connections() -> usize {
    10000
}

fn default_clean_interval() -> u64 {
    5
}

fn default_max_line_length() -> usize {
    crate::framing::DEFAULT_MAX_LINE_LENGTH
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved mode of operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Serve { listen: String },
    Connect { address: String },
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub server: ServerConfig,
    pub client: ClientOptions,
    pub log_level: String,
}

impl Config {
    /// Load configuration from the process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let file_server = toml_config.server;

        let (mode, server) = match cli.command {
            CliCommand::Serve {
                listen,
                max_connections,
                backlog,
                clean_interval,
            } => {
                let server = ServerConfig {
                    backlog: backlog.unwrap_or(file_server.backlog),
                    max_connections: max_connections.unwrap_or(file_server.max_connections),
                    clean_interval: Duration::from_secs(
                        clean_interval.unwrap_or(file_server.clean_interval_secs),
                    ),
                    max_line_length: toml_config.connection.max_line_length,
                };
                let listen = listen.unwrap_or(file_server.listen);
                (Mode::Serve { listen }, server)
            }
            CliCommand::Connect { address } => (
                Mode::Connect { address },
                ServerConfig {
                    max_line_length: toml_config.connection.max_line_length,
                    ..ServerConfig::default()
                },
            ),
        };

        let config = Config {
            mode,
            client: ClientOptions {
                max_line_length: server.max_line_length,
            },
            server,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1"));
        }
        if self.server.clean_interval.is_zero() {
            return Err(ConfigError::Invalid("clean_interval must be at least 1 second"));
        }
        if self.server.max_line_length < 2 {
            return Err(ConfigError::Invalid("max_line_length must be at least 2 bytes"));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {err}", path = .0.display(), err = .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{path}': {err}", path = .0.display(), err = .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
