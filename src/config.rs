//! Configuration module for the line-dispatch proxy.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::backend::{AddressError, BackendAddress};
use crate::dispatcher::{DispatchOptions, RetryDispatcher};

/// Name given to the app built from `--listen`/`--target` flags
pub const CLI_APP_NAME: &str = "cli";

/// Command-line arguments for the proxy
#[derive(Parser, Debug)]
#[command(name = "line-dispatch")]
#[command(author = "line-dispatch authors")]
#[command(version = "0.1.0")]
#[command(about = "A failover proxy for line-based key/value backends", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Front-end address to listen on (repeatable, e.g. 127.0.0.1:7001)
    #[arg(short = 'l', long)]
    pub listen: Vec<String>,

    /// Backend address, in failover order (repeatable)
    #[arg(short = 't', long)]
    pub target: Vec<String>,

    /// Connect timeout per backend attempt, in milliseconds
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    /// Write-then-read timeout per backend attempt, in milliseconds
    #[arg(long)]
    pub exchange_timeout_ms: Option<u64>,

    /// Deadline for one request across all backends, in milliseconds
    #[arg(long)]
    pub request_deadline_ms: Option<u64>,

    /// Maximum concurrent client connections
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

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
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub apps: Vec<AppConfig>,
}

/// Front-end listener configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Maximum concurrent client connections across all listeners
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
        }
    }
}

/// Backend timeouts
#[derive(Debug, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_exchange_timeout_ms")]
    pub exchange_timeout_ms: u64,
    /// No deadline when absent
    pub request_deadline_ms: Option<u64>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            exchange_timeout_ms: default_exchange_timeout_ms(),
            request_deadline_ms: None,
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

/// One proxied application: its front-end addresses and backend pool.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub name: String,
    /// Addresses to accept clients on
    #[serde(default)]
    pub listen: Vec<String>,
    /// Backend addresses, in failover order
    #[serde(default)]
    pub targets: Vec<String>,
}

impl AppConfig {
    /// Parse the target list into a backend pool.
    pub fn pool(&self) -> Result<Vec<BackendAddress>, ConfigError> {
        self.targets
            .iter()
            .map(|target| {
                BackendAddress::parse(target)
                    .map_err(|e| ConfigError::InvalidTarget(self.name.clone(), e))
            })
            .collect()
    }

    /// Build the dispatcher for this app.
    pub fn dispatcher(&self, options: DispatchOptions) -> Result<RetryDispatcher, ConfigError> {
        Ok(RetryDispatcher::new(self.pool()?, options))
    }
}

fn default_max_connections() -> usize {
    10000
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_exchange_timeout_ms() -> u64 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub apps: Vec<AppConfig>,
    pub dispatch: DispatchOptions,
    pub max_connections: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI args over TOML values.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let mut apps = toml_config.apps;
        if !cli.listen.is_empty() || !cli.target.is_empty() {
            apps.push(AppConfig {
                name: CLI_APP_NAME.to_string(),
                listen: cli.listen,
                targets: cli.target,
            });
        }

        let dispatcher = toml_config.dispatcher;
        let dispatch = DispatchOptions {
            connect_timeout: Duration::from_millis(
                cli.connect_timeout_ms.unwrap_or(dispatcher.connect_timeout_ms),
            ),
            exchange_timeout: Duration::from_millis(
                cli.exchange_timeout_ms.unwrap_or(dispatcher.exchange_timeout_ms),
            ),
            request_deadline: cli
                .request_deadline_ms
                .or(dispatcher.request_deadline_ms)
                .map(Duration::from_millis),
        };

        Config {
            apps,
            dispatch,
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Check that every app can be served.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.apps.is_empty() {
            return Err(ConfigError::NoApps);
        }
        if self.dispatch.connect_timeout.is_zero() || self.dispatch.exchange_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.dispatch.request_deadline.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.max_connections == 0 {
            return Err(ConfigError::ZeroConnections);
        }

        for app in &self.apps {
            if app.listen.is_empty() {
                return Err(ConfigError::EmptyApp(app.name.clone(), "listen"));
            }
            if app.targets.is_empty() {
                return Err(ConfigError::EmptyApp(app.name.clone(), "targets"));
            }
            app.pool()?;
        }

        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("No apps configured; use --listen/--target or an [[apps]] table")]
    NoApps,
    #[error("App '{0}' has no {1} addresses")]
    EmptyApp(String, &'static str),
    #[error("App '{0}' has an invalid target: {1}")]
    InvalidTarget(String, #[source] AddressError),
    #[error("Timeouts must be greater than zero")]
    ZeroTimeout,
    #[error("max_connections must be greater than zero")]
    ZeroConnections,
}
