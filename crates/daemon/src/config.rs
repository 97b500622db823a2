//! Configuration management for the TerminalSync daemon.
//!
//! Configuration is TOML-based with serde defaults for every key, loaded from
//! `~/.config/terminalsync/config.toml` by default. Environment variables
//! (`TERMINALSYNC_*`) override file values, which override defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{detect_shell, DEFAULT_MAX_BUFFER_BYTES};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("auth token must be set (auth.token or TERMINALSYNC_TOKEN)")]
    MissingToken,

    #[error("max_clients must be between 1 and 1000, got {0}")]
    InvalidMaxClients(usize),

    #[error("scrollback_lines must be at most 100000, got {0}")]
    InvalidScrollbackLines(usize),

    #[error("max_buffer_bytes must be greater than 0, got {0}")]
    InvalidMaxBufferBytes(usize),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the TerminalSync daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Bind address and admission limits.
    pub server: ServerConfig,

    /// PTY session configuration.
    pub session: SessionConfig,

    /// Authentication settings.
    pub auth: AuthConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// HTTP/WebSocket server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,

    /// Bind port.
    pub port: u16,

    /// Maximum number of concurrently connected clients.
    pub max_clients: usize,

    /// Directory the browser UI assets are served from.
    pub web_root: PathBuf,
}

/// PTY session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell spawned for new sessions.
    pub default_shell: String,

    /// Scrollback lines requested from the tmux adapter on attach.
    pub scrollback_lines: usize,

    /// Per-session output ring capacity in bytes.
    pub max_buffer_bytes: usize,
}

/// Authentication settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared secret required at WebSocket upgrade. Required.
    pub token: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8089,
            max_clients: 10,
            web_root: PathBuf::from("./web"),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: detect_shell(None),
            scrollback_lines: 1000,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("terminalsync")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values. Empty
    /// values are ignored; unparseable numeric values are ignored with a
    /// warning.
    pub fn apply_env_overrides(&mut self) {
        if let Some(token) = env_string("TERMINALSYNC_TOKEN") {
            self.auth.token = token;
        }
        if let Some(host) = env_string("TERMINALSYNC_HOST") {
            self.server.host = host;
        }
        if let Some(port) = env_parsed::<u16>("TERMINALSYNC_PORT") {
            self.server.port = port;
        }
        if let Some(max_clients) = env_parsed::<usize>("TERMINALSYNC_MAX_CLIENTS") {
            self.server.max_clients = max_clients;
        }
        if let Some(web_root) = env_string("TERMINALSYNC_WEB_ROOT") {
            self.server.web_root = PathBuf::from(web_root);
        }
        if let Some(shell) = env_string("TERMINALSYNC_SHELL") {
            self.session.default_shell = shell;
        }
        if let Some(lines) = env_parsed::<usize>("TERMINALSYNC_SCROLLBACK_LINES") {
            self.session.scrollback_lines = lines;
        }
        if let Some(bytes) = env_parsed::<usize>("TERMINALSYNC_MAX_BUFFER_BYTES") {
            self.session.max_buffer_bytes = bytes;
        }
        if let Some(level) = env_string("TERMINALSYNC_LOG_LEVEL") {
            self.daemon.log_level = level;
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.token.is_empty() {
            return Err(ConfigError::MissingToken);
        }

        if self.server.max_clients < 1 || self.server.max_clients > 1000 {
            return Err(ConfigError::InvalidMaxClients(self.server.max_clients));
        }

        if self.session.scrollback_lines > 100_000 {
            return Err(ConfigError::InvalidScrollbackLines(
                self.session.scrollback_lines,
            ));
        }

        if self.session.max_buffer_bytes == 0 {
            return Err(ConfigError::InvalidMaxBufferBytes(
                self.session.max_buffer_bytes,
            ));
        }

        let shell_path = Path::new(&self.session.default_shell);
        if shell_path.is_absolute() {
            if !shell_path.exists() {
                return Err(ConfigError::InvalidShellPath(
                    self.session.default_shell.clone(),
                ));
            }
        } else if which::which(&self.session.default_shell).is_err() {
            return Err(ConfigError::InvalidShellPath(
                self.session.default_shell.clone(),
            ));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// A missing file yields the default configuration; an unreadable or
    /// invalid file is an error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| anyhow::anyhow!("invalid TOML configuration: {e}"))
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}
