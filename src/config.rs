//! Configuration module for the framekv server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::protocols::frame::{DEFAULT_MAX_PAYLOAD, FRAME_HEADER_LEN};
use crate::runtime::request::Protocol;
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Smallest payload limit; every kv error response must fit.
pub const MIN_PAYLOAD: usize = 64;

/// Largest payload limit.
pub const MAX_PAYLOAD_LIMIT: usize = 16 * 1024 * 1024;

/// Largest connection limit.
pub const MAX_CONNECTIONS_LIMIT: usize = 1 << 20;

/// Upper bound on the buffer pool, which is allocated at startup.
pub const MAX_POOL_BYTES: u64 = 4 << 30;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "framekv")]
#[command(version)]
#[command(about = "An in-memory key-value server speaking a length-prefixed pipelined protocol", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:1234)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum frame payload in bytes, enforced on requests and responses
    #[arg(long)]
    pub max_payload: Option<usize>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Payload protocol
    #[arg(short = 'p', long, value_enum)]
    pub protocol: Option<Protocol>,

    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub framing: FramingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Readiness events handled per poll
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Payload protocol
    #[serde(default)]
    pub protocol: Protocol,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            event_capacity: default_event_capacity(),
            backlog: default_backlog(),
            protocol: Protocol::default(),
        }
    }
}

/// Framing configuration
#[derive(Debug, Deserialize)]
pub struct FramingConfig {
    /// Maximum frame payload in bytes
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            max_payload: default_max_payload(),
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
    "0.0.0.0:1234".to_string()
}

fn default_max_connections() -> usize {
    1024
}

fn default_event_capacity() -> usize {
    1024
}

fn default_backlog() -> i32 {
    1024
}

fn default_max_payload() -> usize {
    DEFAULT_MAX_PAYLOAD
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub max_payload: usize,
    pub max_connections: usize,
    pub event_capacity: usize,
    pub backlog: i32,
    pub protocol: Protocol,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 1234)),
            max_payload: default_max_payload(),
            max_connections: default_max_connections(),
            event_capacity: default_event_capacity(),
            backlog: default_backlog(),
            protocol: Protocol::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve parsed CLI arguments, reading the TOML file they name.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::resolve(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence) and validate.
    pub fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen_str = cli.listen.unwrap_or(toml_config.server.listen);
        let listen = listen_str
            .parse()
            .map_err(|_| ConfigError::InvalidListen(listen_str.clone()))?;

        let config = Config {
            listen,
            max_payload: cli.max_payload.unwrap_or(toml_config.framing.max_payload),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            event_capacity: toml_config.server.event_capacity,
            backlog: toml_config.server.backlog,
            protocol: cli.protocol.unwrap_or(toml_config.server.protocol),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_PAYLOAD..=MAX_PAYLOAD_LIMIT).contains(&self.max_payload) {
            return Err(ConfigError::InvalidValue {
                field: "max_payload",
                reason: format!("must be between {MIN_PAYLOAD} and {MAX_PAYLOAD_LIMIT}"),
            });
        }
        if !(1..=MAX_CONNECTIONS_LIMIT).contains(&self.max_connections) {
            return Err(ConfigError::InvalidValue {
                field: "max_connections",
                reason: format!("must be between 1 and {MAX_CONNECTIONS_LIMIT}"),
            });
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "event_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        match self.pool_bytes() {
            Some(bytes) if bytes as u64 <= MAX_POOL_BYTES => Ok(()),
            _ => Err(ConfigError::InvalidValue {
                field: "max_connections",
                reason: format!(
                    "buffers for {} connections of {} bytes exceed {MAX_POOL_BYTES} bytes",
                    self.max_connections, self.max_payload
                ),
            }),
        }
    }

    /// Memory reserved up front for connection buffers: a read and a write
    /// buffer per connection, each holding one full frame.
    pub fn pool_bytes(&self) -> Option<usize> {
        self.max_connections
            .checked_mul(2)?
            .checked_mul(FRAME_HEADER_LEN.checked_add(self.max_payload)?)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {1}", path = .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{path}': {1}", path = .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid listen address '{0}'")]
    InvalidListen(String),
    #[error("Invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "0.0.0.0:1234");
        assert_eq!(config.server.max_connections, 1024);
        assert_eq!(config.server.protocol, Protocol::Echo);
        assert_eq!(config.framing.max_payload, 4096);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:6379"
            max_connections = 64
            protocol = "kv"

            [framing]
            max_payload = 32768

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:6379");
        assert_eq!(config.server.max_connections, 64);
        assert_eq!(config.server.event_capacity, 1024);
        assert_eq!(config.server.protocol, Protocol::Kv);
        assert_eq!(config.framing.max_payload, 32768);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let cli = CliArgs::try_parse_from([
            "framekv",
            "--listen",
            "127.0.0.1:9000",
            "--max-payload",
            "1024",
            "--protocol",
            "kv",
        ])
        .unwrap();
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:1"
            max_connections = 7

            [framing]
            max_payload = 99
            "#,
        )
        .unwrap();

        let config = Config::resolve(cli, toml_config).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.max_payload, 1024);
        assert_eq!(config.max_connections, 7);
        assert_eq!(config.protocol, Protocol::Kv);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_invalid_values() {
        let cli = CliArgs {
            listen: Some("not an address".to_string()),
            ..CliArgs::default()
        };
        assert!(matches!(
            Config::resolve(cli, TomlConfig::default()),
            Err(ConfigError::InvalidListen(_))
        ));

        let cli = CliArgs {
            max_payload: Some(0),
            ..CliArgs::default()
        };
        assert!(matches!(
            Config::resolve(cli, TomlConfig::default()),
            Err(ConfigError::InvalidValue {
                field: "max_payload",
                ..
            })
        ));
    }

    #[test]
    fn test_resource_bounds() {
        let resolve = |args: &[&str]| {
            let mut argv = vec!["framekv"];
            argv.extend_from_slice(args);
            Config::resolve(CliArgs::try_parse_from(argv).unwrap(), TomlConfig::default())
        };

        // Too small for a kv error response.
        assert!(matches!(
            resolve(&["--max-payload", "21"]),
            Err(ConfigError::InvalidValue { field: "max_payload", .. })
        ));
        assert!(matches!(
            resolve(&["--max-payload", "1000000000"]),
            Err(ConfigError::InvalidValue { field: "max_payload", .. })
        ));
        assert!(matches!(
            resolve(&["--max-connections", &usize::MAX.to_string()]),
            Err(ConfigError::InvalidValue { field: "max_connections", .. })
        ));

        // Each limit alone is fine, together the pool would be 32 GiB.
        assert!(matches!(
            resolve(&["--max-payload", "16777216", "--max-connections", "1024"]),
            Err(ConfigError::InvalidValue { field: "max_connections", .. })
        ));

        let config = resolve(&["--max-payload", "64", "--max-connections", "10"]).unwrap();
        assert_eq!(config.pool_bytes(), Some(10 * 2 * 68));
        assert_eq!(Config::default().pool_bytes(), Some(1024 * 2 * 4100));
    }

    #[test]
    fn test_missing_config_file() {
        let cli = CliArgs {
            config: Some(PathBuf::from("/nonexistent/framekv.toml")),
            ..CliArgs::default()
        };
        let err = Config::from_args(cli).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead(..)));
        assert!(err
            .to_string()
            .starts_with("Failed to read config file '/nonexistent/framekv.toml': "));
    }

    #[test]
    fn test_unparsable_config_file() {
        let path = std::env::temp_dir().join(format!("framekv-bad-{}.toml", std::process::id()));
        std::fs::write(&path, "[server\nlisten = ").unwrap();

        let cli = CliArgs {
            config: Some(path.clone()),
            ..CliArgs::default()
        };
        let err = Config::from_args(cli).unwrap_err();
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(err, ConfigError::TomlParse(..)));
        assert!(err
            .to_string()
            .starts_with(&format!("Failed to parse config file '{}': ", path.display())));
    }

    #[test]
    fn test_default_resolves() {
        let config = Config::default();
        assert_eq!(config.listen.port(), 1234);
        assert_eq!(config.max_payload, DEFAULT_MAX_PAYLOAD);
        assert_eq!(config.protocol, Protocol::Echo);
    }
}
