//! Configuration module for the matrix-add server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::session::SessionLimits;
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the matrix-add server
#[derive(Parser, Debug, Default)]
#[command(name = "matrix-add-server")]
#[command(author = "matrix-add-server authors")]
#[command(version = "0.1.0")]
#[command(about = "A TCP server that adds square matrices in parallel", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:12345)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of concurrent sessions
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Seconds to let in-flight sessions finish after a stop signal
    #[arg(long)]
    pub shutdown_grace: Option<u64>,

    /// Seconds to wait for each read from the client
    #[arg(long)]
    pub read_timeout: Option<u64>,

    /// Seconds allowed for one addition
    #[arg(long)]
    pub compute_timeout: Option<u64>,

    /// Largest accepted matrix dimension
    #[arg(long)]
    pub max_dimension: Option<usize>,

    /// Largest accepted payload in bytes
    #[arg(long)]
    pub max_payload: Option<usize>,

    /// Upper bound on workers per request
    #[arg(short = 'w', long)]
    pub max_workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum number of concurrent sessions
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Listen backlog passed to the socket
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Drain period on shutdown, in seconds
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            backlog: default_backlog(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

/// Per-session limits
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    /// Read deadline in seconds
    #[serde(default = "default_timeout")]
    pub read_timeout: u64,
    /// Compute deadline in seconds
    #[serde(default = "default_timeout")]
    pub compute_timeout: u64,
    /// Largest accepted matrix dimension
    #[serde(default = "default_max_dimension")]
    pub max_dimension: usize,
    /// Largest accepted payload in bytes
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
    /// Upper bound on workers per request
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_timeout: default_timeout(),
            compute_timeout: default_timeout(),
            max_dimension: default_max_dimension(),
            max_payload: default_max_payload(),
            max_workers: default_max_workers(),
        }
    }
}

/// Logging configuration
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
    "127.0.0.1:12345".to_string()
}

fn default_max_connections() -> usize {
    1024
}

fn default_backlog() -> i32 {
    1024
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_timeout() -> u64 {
    30
}

fn default_max_dimension() -> usize {
    1024
}

fn default_max_payload() -> usize {
    64 * 1024 * 1024 // 64 MB
}

fn default_max_workers() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub max_connections: usize,
    pub backlog: i32,
    pub shutdown_grace: Duration,
    pub read_timeout: Duration,
    pub compute_timeout: Duration,
    pub max_dimension: usize,
    pub max_payload: usize,
    pub max_workers: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigLoadError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve already-parsed CLI arguments, reading the TOML file they name.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigLoadError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigLoadError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigLoadError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigLoadError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen: SocketAddr = listen
            .parse()
            .map_err(|_| ConfigLoadError::Invalid("listen", listen.clone()))?;

        let config = Config {
            listen,
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            backlog: toml_config.server.backlog,
            shutdown_grace: Duration::from_secs(
                cli.shutdown_grace
                    .unwrap_or(toml_config.server.shutdown_grace),
            ),
            read_timeout: Duration::from_secs(
                cli.read_timeout.unwrap_or(toml_config.session.read_timeout),
            ),
            compute_timeout: Duration::from_secs(
                cli.compute_timeout
                    .unwrap_or(toml_config.session.compute_timeout),
            ),
            max_dimension: cli
                .max_dimension
                .unwrap_or(toml_config.session.max_dimension),
            max_payload: cli.max_payload.unwrap_or(toml_config.session.max_payload),
            max_workers: cli.max_workers.unwrap_or(toml_config.session.max_workers),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigLoadError> {
        let positive = [
            ("max_connections", self.max_connections),
            ("max_dimension", self.max_dimension),
            ("max_payload", self.max_payload),
            ("max_workers", self.max_workers),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigLoadError::Invalid(name, value.to_string()));
            }
        }
        if self.backlog <= 0 {
            return Err(ConfigLoadError::Invalid("backlog", self.backlog.to_string()));
        }
        Ok(())
    }

    /// Limits handed to every session.
    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            read_timeout: self.read_timeout,
            compute_timeout: self.compute_timeout,
            max_dimension: self.max_dimension,
            max_payload: self.max_payload,
            max_workers: self.max_workers,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let server = ServerConfig::default();
        let session = SessionConfig::default();
        Config {
            listen: SocketAddr::from(([127, 0, 0, 1], 12345)),
            max_connections: server.max_connections,
            backlog: server.backlog,
            shutdown_grace: Duration::from_secs(server.shutdown_grace),
            read_timeout: Duration::from_secs(session.read_timeout),
            compute_timeout: Duration::from_secs(session.compute_timeout),
            max_dimension: session.max_dimension,
            max_payload: session.max_payload,
            max_workers: session.max_workers,
            log_level: default_log_level(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigLoadError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str, String),
}

impl std::fmt::Display for ConfigLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigLoadError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigLoadError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigLoadError::Invalid(key, value) => {
                write!(f, "Invalid value for '{key}': {value}")
            }
        }
    }
}

impl std::error::Error for ConfigLoadError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli() -> CliArgs {
        CliArgs {
            log_level: "info".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:12345");
        assert_eq!(config.session.max_dimension, 1024);
        assert_eq!(config.session.max_payload, 64 * 1024 * 1024);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:9000"
            max_connections = 8
            shutdown_grace = 1

            [session]
            read_timeout = 2
            max_dimension = 64
            max_workers = 4

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.server.max_connections, 8);
        assert_eq!(config.server.backlog, 1024);
        assert_eq!(config.session.read_timeout, 2);
        assert_eq!(config.session.compute_timeout, 30);
        assert_eq!(config.session.max_workers, 4);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:9000"

            [session]
            max_workers = 4

            [logging]
            level = "warn"
            "#,
        )
        .unwrap();

        let args = CliArgs {
            listen: Some("127.0.0.1:7000".to_string()),
            log_level: "debug".to_string(),
            ..cli()
        };

        let config = Config::merge(args, toml_config).unwrap();
        assert_eq!(config.listen, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let args = CliArgs {
            listen: Some("not an address".to_string()),
            ..cli()
        };
        assert!(matches!(
            Config::merge(args, TomlConfig::default()),
            Err(ConfigLoadError::Invalid("listen", _))
        ));

        let args = CliArgs {
            max_workers: Some(0),
            ..cli()
        };
        assert!(matches!(
            Config::merge(args, TomlConfig::default()),
            Err(ConfigLoadError::Invalid("max_workers", _))
        ));
    }

    #[test]
    fn test_missing_file() {
        let args = CliArgs {
            config: Some(PathBuf::from("/nonexistent/matrix-add.toml")),
            ..cli()
        };
        assert!(matches!(
            Config::from_cli(args),
            Err(ConfigLoadError::FileRead(..))
        ));
    }
}
