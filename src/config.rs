//! Configuration module for packet-server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Heartbeat checks are never scheduled more often than this.
const MIN_HEARTBEAT_WAIT_SECS: u64 = 5;

/// Wire header size; no packet can be shorter.
const MIN_PACKET_LEN: u16 = 8;

/// Command-line arguments for the packet server
#[derive(Parser, Debug, Default)]
#[command(name = "packet-server")]
#[command(author = "packet-server authors")]
#[command(version = "0.1.0")]
#[command(about = "A multi-process TCP packet server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Port to listen on (may be repeated)
    #[arg(short = 'p', long = "listen-port")]
    pub listen_ports: Vec<u16>,

    /// Number of worker processes forked by the master
    #[arg(short = 'w', long)]
    pub worker_processes: Option<usize>,

    /// Number of business threads per worker process
    #[arg(short = 't', long)]
    pub worker_threads: Option<usize>,

    /// Run a single worker in the current process (no master)
    #[arg(long)]
    pub single_process: bool,

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
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub flood: FloodConfig,
    #[serde(default)]
    pub recycle: RecycleConfig,
    #[serde(default)]
    pub send: SendConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Ports to listen on
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,
    /// Number of worker processes
    #[serde(default = "default_worker_processes")]
    pub worker_processes: usize,
    /// Number of business threads per worker process
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Online connections allowed per worker process
    #[serde(default = "default_worker_connections")]
    pub worker_connections: usize,
    /// Largest accepted `pkg_len` (header + body)
    #[serde(default = "default_max_packet_len")]
    pub max_packet_len: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ports: default_ports(),
            worker_processes: default_worker_processes(),
            worker_threads: default_worker_threads(),
            worker_connections: default_worker_connections(),
            max_packet_len: default_max_packet_len(),
        }
    }
}

/// Idle connection checking
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    /// Register accepted connections with the timer queue
    #[serde(default)]
    pub enabled: bool,
    /// Seconds between checks of one connection
    #[serde(default = "default_heartbeat_wait")]
    pub wait_secs: u64,
    /// Close the connection at its first check regardless of heartbeats
    #[serde(default)]
    pub kick_on_timeout: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            wait_secs: default_heartbeat_wait(),
            kick_on_timeout: false,
        }
    }
}

/// Flood detection
#[derive(Debug, Clone, Deserialize)]
pub struct FloodConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Packets closer together than this count as fast
    #[serde(default = "default_flood_interval")]
    pub interval_ms: u64,
    /// Consecutive fast packets before the connection is closed
    #[serde(default = "default_flood_kick_count")]
    pub kick_count: u32,
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: default_flood_interval(),
            kick_count: default_flood_kick_count(),
        }
    }
}

/// Delayed connection recycling
#[derive(Debug, Clone, Deserialize)]
pub struct RecycleConfig {
    /// Minimum seconds a closed connection waits before reuse
    #[serde(default = "default_recycle_wait")]
    pub wait_secs: u64,
}

impl Default for RecycleConfig {
    fn default() -> Self {
        Self {
            wait_secs: default_recycle_wait(),
        }
    }
}

/// Outbound queue limits
#[derive(Debug, Clone, Deserialize)]
pub struct SendConfig {
    /// Messages queued beyond this are discarded
    #[serde(default = "default_max_queue_len")]
    pub max_queue_len: usize,
    /// A connection with more queued messages than this is closed
    #[serde(default = "default_max_conn_backlog")]
    pub max_conn_backlog: usize,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            max_queue_len: default_max_queue_len(),
            max_conn_backlog: default_max_conn_backlog(),
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

fn default_ports() -> Vec<u16> {
    vec![9000]
}

fn default_worker_processes() -> usize {
    1
}

fn default_worker_threads() -> usize {
    5
}

fn default_worker_connections() -> usize {
    1024
}

fn default_max_packet_len() -> u16 {
    29000
}

fn default_heartbeat_wait() -> u64 {
    20
}

fn default_flood_interval() -> u64 {
    100
}

fn default_flood_kick_count() -> u32 {
    10
}

fn default_recycle_wait() -> u64 {
    60
}

fn default_max_queue_len() -> usize {
    50_000
}

fn default_max_conn_backlog() -> usize {
    400
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub ports: Vec<u16>,
    pub worker_processes: usize,
    pub worker_threads: usize,
    pub worker_connections: usize,
    pub max_packet_len: u16,
    pub heartbeat: HeartbeatConfig,
    pub flood: FloodConfig,
    pub recycle: RecycleConfig,
    pub send: SendConfig,
    pub single_process: bool,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve already-parsed CLI arguments against their config file.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = match cli.config {
            Some(ref path) => read_toml(path)?,
            None => TomlConfig::default(),
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let mut heartbeat = toml_config.heartbeat;
        heartbeat.wait_secs = heartbeat.wait_secs.max(MIN_HEARTBEAT_WAIT_SECS);

        Config {
            ports: if cli.listen_ports.is_empty() {
                toml_config.server.ports
            } else {
                cli.listen_ports
            },
            worker_processes: cli
                .worker_processes
                .unwrap_or(toml_config.server.worker_processes),
            worker_threads: cli
                .worker_threads
                .unwrap_or(toml_config.server.worker_threads),
            worker_connections: toml_config.server.worker_connections,
            max_packet_len: toml_config.server.max_packet_len,
            heartbeat,
            flood: toml_config.flood,
            recycle: toml_config.recycle,
            send: toml_config.send,
            single_process: cli.single_process,
            log_level: if !cli.log_level.is_empty() && cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.is_empty() {
            return Err(ConfigError::Invalid("at least one listen port is required"));
        }
        if self.worker_processes == 0 {
            return Err(ConfigError::Invalid("worker_processes must be at least 1"));
        }
        if self.worker_threads == 0 {
            return Err(ConfigError::Invalid("worker_threads must be at least 1"));
        }
        if self.worker_connections == 0 {
            return Err(ConfigError::Invalid("worker_connections must be at least 1"));
        }
        if self.max_packet_len < MIN_PACKET_LEN {
            return Err(ConfigError::Invalid(
                "max_packet_len must cover at least the packet header",
            ));
        }
        Ok(())
    }

    /// Interval between heartbeat checks of one connection.
    pub fn heartbeat_wait(&self) -> Duration {
        Duration::from_secs(self.heartbeat.wait_secs)
    }

    /// Minimum time a closed connection stays in the recycle list.
    pub fn recycle_wait(&self) -> Duration {
        Duration::from_secs(self.recycle.wait_secs)
    }
}

fn read_toml(path: &Path) -> Result<TomlConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
    toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.to_path_buf(), e))
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {}
