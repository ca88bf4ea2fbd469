//! Configuration: command-line arguments merged over a TOML file.
//!
//! CLI arguments take precedence over config file values; `-g` inline
//! directives are TOML fragments merged over the file before
//! deserialization, so `-g 'worker.processes = 2'` overrides the file the
//! same way a CLI flag would.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "palisade")]
#[command(about = "An event-driven server core", long_about = None)]
#[command(disable_version_flag = true)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Prefix directory for relative paths (pid file, logs)
    #[arg(short = 'p', long)]
    pub prefix: Option<PathBuf>,

    /// Inline configuration directive (TOML fragment), may repeat
    #[arg(short = 'g', long = "global")]
    pub directives: Vec<String>,

    /// Send a signal to the running master: stop, quit, reopen, reload
    #[arg(short = 's', long)]
    pub signal: Option<String>,

    /// Test the configuration and exit
    #[arg(short = 't', long, default_value_t = false)]
    pub test: bool,

    /// Test the configuration, dump it, and exit
    #[arg(short = 'T', long, default_value_t = false)]
    pub test_dump: bool,

    /// Suppress non-error output during configuration test
    #[arg(short = 'q', long, default_value_t = false)]
    pub quiet: bool,

    /// Print version and exit
    #[arg(short = 'v', long, default_value_t = false)]
    pub version: bool,

    /// Print version and build information and exit
    #[arg(short = 'V', long, default_value_t = false)]
    pub version_full: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default = "default_pid_path")]
    pub pid_path: PathBuf,
    #[serde(default = "default_process_mode")]
    pub process_mode: String,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub event: EventConfig,
    #[serde(default, rename = "listener")]
    pub listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Worker pool configuration.
#[derive(Debug, Deserialize)]
pub struct WorkerConfig {
    /// Number of worker processes (0 = number of CPU cores)
    #[serde(default)]
    pub processes: usize,
    /// Connection table size per worker
    #[serde(default = "default_connections")]
    pub connections: usize,
    /// Grace period for draining connections on shutdown, in ms
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            processes: 0,
            connections: default_connections(),
            shutdown_timeout_ms: default_shutdown_timeout(),
        }
    }
}

/// Event engine configuration.
#[derive(Debug, Deserialize)]
pub struct EventConfig {
    /// Serialize accepts across workers sharing a listener
    #[serde(default = "default_accept_mutex")]
    pub accept_mutex: bool,
    /// How long a worker that lost the accept mutex waits before retrying
    #[serde(default = "default_accept_mutex_delay")]
    pub accept_mutex_delay_ms: u64,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            accept_mutex: default_accept_mutex(),
            accept_mutex_delay_ms: default_accept_mutex_delay(),
        }
    }
}

/// One listening socket.
#[derive(Debug, Deserialize, Clone)]
pub struct ListenerConfig {
    /// Address to bind, e.g. "127.0.0.1:8080"
    pub listen: SocketAddr,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Kernel-level accept balancing instead of the accept mutex
    #[serde(default)]
    pub reuseport: bool,
    /// Per-connection pool arena size in bytes
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default)]
    pub keepalive: bool,
    pub rcvbuf: Option<usize>,
    pub sndbuf: Option<usize>,
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Error log path; empty means stderr
    #[serde(default)]
    pub error_log: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            error_log: String::new(),
        }
    }
}

fn default_pid_path() -> PathBuf {
    PathBuf::from("palisade.pid")
}

fn default_process_mode() -> String {
    "master".to_string()
}

fn default_connections() -> usize {
    512
}

fn default_shutdown_timeout() -> u64 {
    10_000
}

fn default_accept_mutex() -> bool {
    true
}

fn default_accept_mutex_delay() -> u64 {
    500
}

fn default_backlog() -> i32 {
    511
}

fn default_pool_size() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessMode {
    Master,
    Single,
}

/// Final resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub pid_path: PathBuf,
    pub process_mode: ProcessMode,
    pub worker_processes: usize,
    pub worker_connections: usize,
    pub shutdown_timeout_ms: u64,
    pub accept_mutex: bool,
    pub accept_mutex_delay_ms: u64,
    pub listeners: Vec<ListenerConfig>,
    pub log_level: String,
    pub error_log: Option<PathBuf>,
    pub prefix: PathBuf,
}

/// Where the configuration came from, kept so a reconfigure signal can
/// re-read the same sources.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub path: Option<PathBuf>,
    pub directives: Vec<String>,
    pub prefix: PathBuf,
    pub log_level: String,
}

impl Config {
    /// Resolve configuration from a source description (file + inline
    /// directives). Used at startup and again on every reconfigure.
    pub fn load(source: &ConfigSource) -> Result<Self, ConfigError> {
        let mut table = if let Some(ref path) = source.path {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::FileRead(path.clone(), e))?;
            contents
                .parse::<toml::Table>()
                .map_err(|e| ConfigError::TomlParse(path.clone(), e))?
        } else {
            toml::Table::new()
        };

        for directive in &source.directives {
            let fragment = directive
                .parse::<toml::Table>()
                .map_err(ConfigError::Directive)?;
            merge_tables(&mut table, fragment);
        }

        let parsed: TomlConfig = table.try_into().map_err(ConfigError::Schema)?;
        Self::resolve(parsed, source)
    }

    fn resolve(parsed: TomlConfig, source: &ConfigSource) -> Result<Self, ConfigError> {
        let process_mode = match parsed.process_mode.as_str() {
            "master" => ProcessMode::Master,
            "single" => ProcessMode::Single,
            other => return Err(ConfigError::BadValue("process_mode", other.to_string())),
        };

        if parsed.worker.connections < 8 {
            return Err(ConfigError::BadValue(
                "worker.connections",
                parsed.worker.connections.to_string(),
            ));
        }

        let worker_processes = if parsed.worker.processes == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            parsed.worker.processes
        };

        let pid_path = if parsed.pid_path.is_absolute() {
            parsed.pid_path
        } else {
            source.prefix.join(parsed.pid_path)
        };

        let error_log = if parsed.logging.error_log.is_empty() {
            None
        } else {
            let p = PathBuf::from(&parsed.logging.error_log);
            Some(if p.is_absolute() {
                p
            } else {
                source.prefix.join(p)
            })
        };

        // CLI --log-level wins over the file when explicitly set.
        let log_level = if source.log_level != "info" {
            source.log_level.clone()
        } else {
            parsed.logging.level
        };

        Ok(Config {
            pid_path,
            process_mode,
            worker_processes,
            worker_connections: parsed.worker.connections,
            shutdown_timeout_ms: parsed.worker.shutdown_timeout_ms,
            accept_mutex: parsed.event.accept_mutex,
            accept_mutex_delay_ms: parsed.event.accept_mutex_delay_ms,
            listeners: parsed.listeners,
            log_level,
            error_log,
            prefix: source.prefix.clone(),
        })
    }
}

/// Deep-merge `from` into `into`; scalar and array values in `from` win.
fn merge_tables(into: &mut toml::Table, from: toml::Table) {
    for (key, value) in from {
        match (into.get_mut(&key), value) {
            (Some(toml::Value::Table(dst)), toml::Value::Table(src)) => {
                merge_tables(dst, src);
            }
            (_, value) => {
                into.insert(key, value);
            }
        }
    }
}

/// Configuration loading errors.
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Directive(toml::de::Error),
    Schema(toml::de::Error),
    BadValue(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Directive(e) => write!(f, "invalid -g directive: {e}"),
            ConfigError::Schema(e) => write!(f, "invalid configuration: {e}"),
            ConfigError::BadValue(key, v) => write!(f, "invalid value for {key}: {v}"),
        }
    }
}

impl std::error::Error for ConfigError {}

pub fn source_from_cli(cli: &CliArgs) -> ConfigSource {
    ConfigSource {
        path: cli.config.clone(),
        directives: cli.directives.clone(),
        prefix: cli
            .prefix
            .clone()
            .unwrap_or_else(|| Path::new(".").to_path_buf()),
        log_level: cli.log_level.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> ConfigSource {
        ConfigSource {
            path: None,
            directives: Vec::new(),
            prefix: PathBuf::from("."),
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::load(&source()).expect("load");
        assert_eq!(config.worker_connections, 512);
        assert_eq!(config.process_mode, ProcessMode::Master);
        assert!(config.accept_mutex);
        assert_eq!(config.accept_mutex_delay_ms, 500);
        assert!(config.listeners.is_empty());
        assert!(config.worker_processes >= 1);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            process_mode = "single"
            pid_path = "run/palisade.pid"

            [worker]
            processes = 4
            connections = 128
            shutdown_timeout_ms = 0

            [event]
            accept_mutex = false

            [[listener]]
            listen = "127.0.0.1:8080"
            backlog = 1024
            reuseport = true

            [[listener]]
            listen = "127.0.0.1:8081"

            [logging]
            level = "debug"
        "#;

        let parsed: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(parsed.worker.processes, 4);
        assert_eq!(parsed.worker.connections, 128);
        assert_eq!(parsed.worker.shutdown_timeout_ms, 0);
        assert!(!parsed.event.accept_mutex);
        assert_eq!(parsed.listeners.len(), 2);
        assert_eq!(parsed.listeners[0].backlog, 1024);
        assert!(parsed.listeners[0].reuseport);
        assert_eq!(parsed.listeners[1].backlog, 511);
        assert_eq!(parsed.logging.level, "debug");
    }

    #[test]
    fn test_inline_directives_override_file_values() {
        let mut src = source();
        src.directives = vec![
            "worker.connections = 64".to_string(),
            "[[listener]]\nlisten = \"127.0.0.1:9000\"".to_string(),
        ];
        let config = Config::load(&src).expect("load");
        assert_eq!(config.worker_connections, 64);
        assert_eq!(config.listeners.len(), 1);
        assert_eq!(config.listeners[0].listen.port(), 9000);
    }

    #[test]
    fn test_bad_directive_is_rejected() {
        let mut src = source();
        src.directives = vec!["not valid toml ===".to_string()];
        assert!(Config::load(&src).is_err());
    }

    #[test]
    fn test_tiny_connection_table_rejected() {
        let mut src = source();
        src.directives = vec!["worker.connections = 2".to_string()];
        assert!(matches!(
            Config::load(&src),
            Err(ConfigError::BadValue("worker.connections", _))
        ));
    }

    #[test]
    fn test_relative_paths_resolve_under_prefix() {
        let mut src = source();
        src.prefix = PathBuf::from("/srv/palisade");
        src.directives = vec!["logging.error_log = \"logs/error.log\"".to_string()];
        let config = Config::load(&src).expect("load");
        assert_eq!(config.pid_path, PathBuf::from("/srv/palisade/palisade.pid"));
        assert_eq!(
            config.error_log.as_deref(),
            Some(Path::new("/srv/palisade/logs/error.log"))
        );
    }
}
