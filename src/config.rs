//! TOML configuration for the dashlink CLI.
//!
//! Everything here has a sensible default, so a missing file or section never
//! blocks a connection attempt; the CLI overrides individual values from its
//! own flags.
//!
//! ```toml
//! [link]
//! # port = "/dev/ttyACM0"   # auto-detect when unset
//! baud_rate = 115200
//!
//! [telemetry]
//! rate_hz = 50
//!
//! [logging]
//! level = "info"
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

/// Errors from loading or validating a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Serial port path; auto-detect when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_rate_hz")]
    pub rate_hz: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// One of: error, warn, info, debug, trace.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_rate_hz() -> u16 {
    50
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: default_baud_rate(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            rate_hz: default_rate_hz(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            telemetry: TelemetryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub async fn load(path: &str) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).await?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, path: &str) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).await?;
        Ok(())
    }

    /// Write a default configuration file for a fresh checkout.
    pub async fn create_default(path: &str) -> Result<(), ConfigError> {
        Config::default().save(path).await
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.link.baud_rate == 0 {
            return Err(ConfigError::Invalid("baud_rate must be non-zero".into()));
        }
        if self.telemetry.rate_hz == 0 || self.telemetry.rate_hz > 1000 {
            return Err(ConfigError::Invalid(format!(
                "telemetry rate_hz {} out of range 1..=1000",
                self.telemetry.rate_hz
            )));
        }
        const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
        if !LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "unknown log level '{}'",
                self.logging.level
            )));
        }
        Ok(())
    }
}
