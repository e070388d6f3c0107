//! Configuration for the relay.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values, which take
//! precedence over built-in defaults.

use crate::runtime::broadcast::BroadcastPolicy;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// Command-line arguments for the relay
#[derive(Parser, Debug, Default)]
#[command(name = "chat-relay")]
#[command(version)]
#[command(about = "A TCP relay that rebroadcasts every received chunk to connected clients", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// IPv4 address to listen on (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on (0 picks a free port)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of worker threads (defaults to number of CPU cores; values
    /// below 1 mean 1). Also accepted as `-threadcount`.
    #[arg(short = 't', long = "threadcount", visible_alias = "threads", allow_negative_numbers = true)]
    pub threads: Option<i64>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Accepts kept outstanding on the listening socket
    #[arg(long)]
    pub pending_accepts: Option<usize>,

    /// Maximum number of simultaneous clients
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Size in bytes of each receive/send buffer
    #[arg(short, long)]
    pub buffer_size: Option<usize>,

    /// Who receives a relayed chunk
    #[arg(long, value_enum)]
    pub broadcast: Option<BroadcastPolicy>,

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
    pub relay: RelayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and worker configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of worker threads
    pub threads: Option<i64>,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_pending_accepts")]
    pub pending_accepts: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            threads: None,
            backlog: default_backlog(),
            pending_accepts: default_pending_accepts(),
            max_connections: default_max_connections(),
        }
    }
}

/// Relay behavior
#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default)]
    pub broadcast: BroadcastPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            broadcast: BroadcastPolicy::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_backlog() -> i32 {
    1024
}

fn default_pending_accepts() -> usize {
    4
}

fn default_max_connections() -> usize {
    1024
}

fn default_buffer_size() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub threads: usize,
    pub backlog: i32,
    pub pending_accepts: usize,
    pub max_connections: usize,
    pub buffer_size: usize,
    pub broadcast: BroadcastPolicy,
    pub log_level: String,
    /// Adjustments made while resolving, logged once logging is up.
    pub warnings: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            threads: num_cpus(),
            backlog: default_backlog(),
            pending_accepts: default_pending_accepts(),
            max_connections: default_max_connections(),
            buffer_size: default_buffer_size(),
            broadcast: BroadcastPolicy::default(),
            log_level: default_log_level(),
            warnings: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from the process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(std::env::args())
    }

    /// Load configuration from `args` (program name first).
    pub fn from_args<I>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = String>,
    {
        let cli = CliArgs::parse_from(normalize_args(args));

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

    /// Merge CLI args over TOML values and validate the result.
    pub fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let mut warnings = Vec::new();

        let threads = match cli.threads.or(toml_config.server.threads) {
            None => num_cpus(),
            Some(n) if n < 1 => {
                warnings.push(format!("thread count {n} is not positive, using 1"));
                1
            }
            Some(n) => usize::try_from(n).unwrap_or(usize::MAX),
        };

        let config = Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            threads,
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            pending_accepts: cli
                .pending_accepts
                .unwrap_or(toml_config.server.pending_accepts),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            buffer_size: cli.buffer_size.unwrap_or(toml_config.relay.buffer_size),
            broadcast: cli.broadcast.unwrap_or(toml_config.relay.broadcast),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            warnings,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be at least 1".into()));
        }
        if self.pending_accepts == 0 {
            return Err(ConfigError::Invalid(
                "pending_accepts must be at least 1".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.backlog < 1 {
            return Err(ConfigError::Invalid("backlog must be at least 1".into()));
        }
        Ok(())
    }
}

/// Rewrite the legacy single-dash `-threadcount` into its long form.
fn normalize_args<I>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    args.into_iter()
        .map(|arg| match arg.strip_prefix("-threadcount") {
            Some(rest) if rest.is_empty() || rest.starts_with('=') => {
                format!("--threadcount{rest}")
            }
            _ => arg,
        })
        .collect()
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
