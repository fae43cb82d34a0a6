// src/config.rs
//! Configuration file parsing
//!
//! Supports TOML configuration files with the following sections:
//! - [delivery] - Subscriber buffering, module id limits
//! - [server] - HTTP bind address
//! - [logging] - Default log filter
//!
//! Every field has a default, so an empty file (or no file) is valid.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

/// TOML configuration file structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeliveryConfig {
    /// Controller settings
    #[serde(default)]
    pub delivery: DeliverySection,

    /// HTTP surface settings
    #[serde(default)]
    pub server: ServerSection,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Delivery controller section
#[derive(Debug, Clone, Deserialize)]
pub struct DeliverySection {
    /// Snapshots buffered per subscriber before the oldest are dropped
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Longest accepted module identifier, in bytes
    #[serde(default = "default_max_module_id_len")]
    pub max_module_id_len: usize,
}

impl Default for DeliverySection {
    fn default() -> Self {
        Self {
            event_buffer: default_event_buffer(),
            max_module_id_len: default_max_module_id_len(),
        }
    }
}

/// Server configuration section
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// API bind address
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Logging configuration section
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    /// Filter used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_event_buffer() -> usize {
    256
}

fn default_max_module_id_len() -> usize {
    128
}

fn default_bind() -> String {
    "127.0.0.1:7891".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DeliveryConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config = Self::parse(&content)
            .map_err(|e| Error::Config(format!("{} ({})", e, path.display())))?;
        Ok(config)
    }

    /// Parse and validate configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: DeliveryConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, otherwise use defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.delivery.event_buffer == 0 {
            return Err(Error::Config(
                "delivery.event_buffer must be at least 1".to_string(),
            ));
        }

        if self.delivery.max_module_id_len == 0 {
            return Err(Error::Config(
                "delivery.max_module_id_len must be at least 1".to_string(),
            ));
        }

        self.server.bind.parse::<SocketAddr>().map_err(|e| {
            Error::Config(format!("Invalid server.bind address {}: {}", self.server.bind, e))
        })?;

        Ok(())
    }

    /// Override the subscriber buffer size
    pub fn with_event_buffer(mut self, size: usize) -> Self {
        self.delivery.event_buffer = size;
        self
    }
}
