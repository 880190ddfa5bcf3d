//! Configuration module for stress-echo.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Command-line arguments for stress-echo
#[derive(Parser, Debug)]
#[command(name = "stress-echo")]
#[command(author = "stress-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "TCP echo server under synthetic load, and a client to stress it", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub mode: Mode,
}

/// Which side of the exchange to run
#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Run the echo server and its background load workers
    Server(ServerArgs),
    /// Run the stress client against an echo server
    Client(ClientArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Address to bind to (e.g., 0.0.0.0:8000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of connections served at once
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Number of CPU stressor threads (defaults to number of CPU cores)
    #[arg(long)]
    pub cpu_workers: Option<usize>,

    /// Number of memory stressor threads
    #[arg(long)]
    pub memory_workers: Option<usize>,

    /// Bytes allocated by a memory stressor per step
    #[arg(long)]
    pub memory_chunk: Option<usize>,

    /// Milliseconds between memory allocations
    #[arg(long)]
    pub memory_interval_ms: Option<u64>,

    /// Cap on memory held by all stressors in bytes (0 = unbounded)
    #[arg(short = 'm', long)]
    pub max_memory: Option<usize>,

    /// Serve echo only, without background load
    #[arg(long)]
    pub no_load: bool,
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Server address to connect to (e.g., localhost:8000)
    #[arg(short = 't', long)]
    pub target: Option<String>,

    /// Payload sent on every connection
    #[arg(short = 'p', long)]
    pub payload: Option<String>,

    /// How long to keep sending, in seconds (0 = until interrupted)
    #[arg(short = 'd', long)]
    pub duration: Option<u64>,

    /// Milliseconds to sleep after each attempt
    #[arg(long)]
    pub interval_ms: Option<u64>,

    /// Stop after this many attempts
    #[arg(short = 'n', long)]
    pub iterations: Option<u64>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Echo server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Bytes read per receive
    #[serde(default = "default_read_size")]
    pub read_size: usize,
    /// Seconds between stats log lines (0 = disabled)
    #[serde(default = "default_report_interval")]
    pub report_interval: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            read_size: default_read_size(),
            report_interval: default_report_interval(),
        }
    }
}

/// Background load configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoadConfig {
    /// Run the stressors at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// CPU stressor threads (None = one per core)
    pub cpu_workers: Option<usize>,
    /// Iterations in one busy round between stop checks
    #[serde(default = "default_spin_iterations")]
    pub spin_iterations: u64,
    /// Memory stressor threads
    #[serde(default = "default_memory_workers")]
    pub memory_workers: usize,
    /// Bytes allocated per step
    #[serde(default = "default_memory_chunk")]
    pub memory_chunk: usize,
    /// Milliseconds between allocations
    #[serde(default = "default_memory_interval_ms")]
    pub memory_interval_ms: u64,
    /// Cap on total held bytes (0 = unbounded)
    #[serde(default)]
    pub max_memory: usize,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cpu_workers: None,
            spin_iterations: default_spin_iterations(),
            memory_workers: default_memory_workers(),
            memory_chunk: default_memory_chunk(),
            memory_interval_ms: default_memory_interval_ms(),
            max_memory: 0,
        }
    }
}

impl LoadConfig {
    /// Number of CPU stressors to start.
    pub fn cpu_worker_count(&self) -> usize {
        if !self.enabled {
            return 0;
        }
        self.cpu_workers.unwrap_or_else(num_cpus)
    }

    /// Number of memory stressors to start.
    pub fn memory_worker_count(&self) -> usize {
        if self.enabled {
            self.memory_workers
        } else {
            0
        }
    }

    pub fn memory_interval(&self) -> Duration {
        Duration::from_millis(self.memory_interval_ms)
    }
}

/// Stress client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Server to connect to
    #[serde(default = "default_target")]
    pub target: String,
    /// Bytes sent on each connection
    #[serde(default = "default_payload")]
    pub payload: String,
    /// Seconds to run (0 = forever)
    #[serde(default = "default_duration")]
    pub duration: u64,
    /// Milliseconds to sleep after each attempt
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Maximum attempts
    pub iterations: Option<u64>,
    /// Bytes read for the reply
    #[serde(default = "default_read_size")]
    pub read_size: usize,
    /// Milliseconds allowed for connect
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Milliseconds allowed for the reply
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            target: default_target(),
            payload: default_payload(),
            duration: default_duration(),
            interval_ms: default_interval_ms(),
            iterations: None,
            read_size: default_read_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl ClientConfig {
    /// Total run time, or `None` to run until interrupted.
    pub fn run_for(&self) -> Option<Duration> {
        match self.duration {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
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
    "0.0.0.0:8000".to_string()
}

fn default_backlog() -> i32 {
    1024
}

fn default_max_connections() -> usize {
    10000
}

fn default_read_size() -> usize {
    1024
}

fn default_report_interval() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_spin_iterations() -> u64 {
    10_000_000
}

fn default_memory_workers() -> usize {
    2
}

fn default_memory_chunk() -> usize {
    10 * 1024 * 1024 // 10 MB
}

fn default_memory_interval_ms() -> u64 {
    100
}

fn default_target() -> String {
    "localhost:8000".to_string()
}

fn default_payload() -> String {
    "Stress test data".to_string()
}

fn default_duration() -> u64 {
    15
}

fn default_interval_ms() -> u64 {
    100
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_read_timeout_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Role selected on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub server: ServerConfig,
    pub load: LoadConfig,
    pub client: ClientConfig,
    pub log_level: String,
}

impl Config {
    /// Load configuration from process arguments and optional TOML file.
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

        let TomlConfig {
            mut server,
            mut load,
            mut client,
            logging,
        } = toml_config;

        let role = match cli.mode {
            Mode::Server(args) => {
                if let Some(listen) = args.listen {
                    server.listen = listen;
                }
                server.max_connections = args.max_connections.unwrap_or(server.max_connections);
                load.cpu_workers = args.cpu_workers.or(load.cpu_workers);
                load.memory_workers = args.memory_workers.unwrap_or(load.memory_workers);
                load.memory_chunk = args.memory_chunk.unwrap_or(load.memory_chunk);
                load.memory_interval_ms = args
                    .memory_interval_ms
                    .unwrap_or(load.memory_interval_ms);
                load.max_memory = args.max_memory.unwrap_or(load.max_memory);
                if args.no_load {
                    load.enabled = false;
                }
                Role::Server
            }
            Mode::Client(args) => {
                if let Some(target) = args.target {
                    client.target = target;
                }
                if let Some(payload) = args.payload {
                    client.payload = payload;
                }
                client.duration = args.duration.unwrap_or(client.duration);
                client.interval_ms = args.interval_ms.unwrap_or(client.interval_ms);
                client.iterations = args.iterations.or(client.iterations);
                Role::Client
            }
        };

        let config = Config {
            role,
            server,
            load,
            client,
            log_level: cli.log_level.unwrap_or(logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.role {
            Role::Server => {
                self.server
                    .listen
                    .parse::<SocketAddr>()
                    .map_err(|e| ConfigError::InvalidListen(self.server.listen.clone(), e))?;
                if self.server.read_size == 0 {
                    return Err(ConfigError::InvalidValue("server.read_size must be non-zero"));
                }
                if self.server.max_connections == 0
                    || self.server.max_connections > Semaphore::MAX_PERMITS
                {
                    return Err(ConfigError::InvalidValue(
                        "server.max_connections must be between 1 and the semaphore permit limit",
                    ));
                }
                if self.server.backlog < 0 {
                    return Err(ConfigError::InvalidValue("server.backlog must not be negative"));
                }
                if self.load.memory_chunk == 0 {
                    return Err(ConfigError::InvalidValue("load.memory_chunk must be non-zero"));
                }
                if self.load.spin_iterations == 0 {
                    return Err(ConfigError::InvalidValue(
                        "load.spin_iterations must be non-zero",
                    ));
                }
            }
            Role::Client => {
                if self.client.read_size == 0 {
                    return Err(ConfigError::InvalidValue("client.read_size must be non-zero"));
                }
                if self.client.connect_timeout_ms == 0 {
                    return Err(ConfigError::InvalidValue(
                        "client.connect_timeout_ms must be non-zero",
                    ));
                }
                if self.client.read_timeout_ms == 0 {
                    return Err(ConfigError::InvalidValue(
                        "client.read_timeout_ms must be non-zero",
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidListen(String, std::net::AddrParseError),
    InvalidValue(&'static str),
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
            ConfigError::InvalidListen(addr, e) => {
                write!(f, "Invalid listen address '{}': {}", addr, e)
            }
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
