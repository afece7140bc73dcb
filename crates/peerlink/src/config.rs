//! Configuration management for PeerLink.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/peerlink/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::ConnectionRole;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection::{MediaOptions, SessionOptions};
use crate::engine::webrtc::DEFAULT_STUN_SERVERS;

/// Default signaling server URL.
pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("signaling url must start with ws:// or wss://, got {0}")]
    InvalidSignalingUrl(String),

    #[error("timeout_secs must be between 1 and 3600 seconds, got {0}")]
    InvalidTimeout(u64),

    #[error("poll_interval_ms must be greater than 0 and shorter than the timeout, got {0}")]
    InvalidPollInterval(u64),

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Signaling server settings.
    pub signaling: SignalingConfig,

    /// Negotiation session settings.
    pub session: SessionConfig,

    /// Local media settings.
    pub media: MediaConfig,

    /// ICE server settings.
    pub network: NetworkConfig,

    /// Logging settings.
    pub log: LogConfig,
}

/// Signaling server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SignalingConfig {
    /// URL of the signaling server.
    pub url: String,
}

/// Negotiation session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Session identifier. Empty means a random one per session.
    pub id: String,

    /// Which side of the handshake this endpoint plays.
    pub role: ConnectionRole,

    /// Seconds to wait for the data channel to open.
    pub timeout_secs: u64,

    /// Milliseconds between readiness checks.
    pub poll_interval_ms: u64,

    /// Milliseconds to keep signaling open after the session is ready.
    pub close_grace_ms: u64,
}

/// Local media configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MediaConfig {
    /// Attach a video source once the session is ready.
    pub enabled: bool,

    /// Media device identifier.
    pub device_id: String,
}

/// ICE server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// List of STUN servers for NAT traversal.
    pub stun_servers: Vec<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Verbose negotiation logging. Forces the debug level.
    pub debug: bool,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_SIGNALING_URL.to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            role: ConnectionRole::Server,
            timeout_secs: 5,
            poll_interval_ms: 100,
            close_grace_ms: 500,
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        let media = MediaOptions::default();
        Self {
            enabled: media.enabled,
            device_id: media.device_id,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            debug: false,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("peerlink")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PEERLINK_SIGNALING_URL: Override signaling server URL
    /// - PEERLINK_SESSION_ID: Override session identifier
    /// - PEERLINK_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("PEERLINK_SIGNALING_URL") {
            if !url.is_empty() {
                tracing::info!("Overriding signaling url from environment: {}", url);
                self.signaling.url = url;
            }
        }

        if let Ok(id) = std::env::var("PEERLINK_SESSION_ID") {
            if !id.is_empty() {
                tracing::info!("Overriding session id from environment: {}", id);
                self.session.id = id;
            }
        }

        if let Ok(level) = std::env::var("PEERLINK_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.log.level = level;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = &self.signaling.url;
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(ConfigError::InvalidSignalingUrl(url.clone()));
        }

        let timeout = self.session.timeout_secs;
        if timeout == 0 || timeout > 3600 {
            return Err(ConfigError::InvalidTimeout(timeout));
        }

        let poll = self.session.poll_interval_ms;
        if poll == 0 || poll >= timeout.saturating_mul(1000) {
            return Err(ConfigError::InvalidPollInterval(poll));
        }

        let level = self.log.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log.level.clone()));
        }

        Ok(())
    }

    /// The tracing filter directive for this configuration.
    pub fn log_filter(&self) -> String {
        if self.log.debug {
            "debug".to_string()
        } else {
            self.log.level.to_lowercase()
        }
    }

    /// Builds session options from this configuration.
    ///
    /// An empty session id gets a random one.
    pub fn session_options(&self) -> SessionOptions {
        let mut options = SessionOptions::new(self.session.role, self.signaling.url.clone())
            .with_timeout(Duration::from_secs(self.session.timeout_secs))
            .with_poll_interval(Duration::from_millis(self.session.poll_interval_ms))
            .with_close_grace(Duration::from_millis(self.session.close_grace_ms))
            .with_debug(self.log.debug);

        if !self.session.id.is_empty() {
            options = options.with_session_id(self.session.id.clone());
        }
        if self.media.enabled {
            options = options.with_media(self.media.device_id.clone());
        }
        options
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
