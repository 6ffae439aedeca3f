use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use thiserror::Error;
use crate::discovery::range::RangeSpec;

/// Characters accepted as `slug_separator`
pub const SLUG_SEPARATORS: &[&str] = &["_", "-", "$", ":", ";", "!", "@", "#", "%", "^", "~"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid slug separator: '{0}'")]
    InvalidSeparator(String),
    #[error("invalid duration: {0}")]
    InvalidDuration(String),
    #[error("{name} must be a positive number of seconds, got {value}")]
    InvalidPollInterval { name: &'static str, value: f64 },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mqtt: MqttConfig,
    /// Seconds between probes while a device is active
    #[serde(default = "default_poll_secs")]
    pub poll_active: f64,
    /// Seconds between probes while a device is idle
    #[serde(default = "default_poll_secs")]
    pub poll_idle: f64,
    /// Failed probes tolerated before a device is marked off or gone
    #[serde(default = "default_poll_retries")]
    pub poll_retries: u32,
    /// Freshness window during which a probed address is not probed again
    #[serde(default = "default_discover_expire")]
    pub discover_expire: DurationSpec,
    #[serde(default)]
    pub discover_upnp: bool,
    #[serde(default)]
    pub roku_ips: Vec<RangeSpec>,
    pub new_roku_topic: Option<String>,
    pub new_roku_attribute: Option<String>,
    pub roku_set_topic: Option<String>,
    pub roku_send_topic: Option<String>,
    pub roku_state_topic: Option<String>,
    pub roku_app_topic: Option<String>,
    pub status_topic: Option<String>,
    #[serde(default = "default_slug_separator")]
    pub slug_separator: String,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    /// Defaults to 1883, or 8883 when a CA file is configured
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// PEM CA bundle; enables TLS
    pub cafile: Option<PathBuf>,
    pub client_id: Option<String>,
    #[serde(default = "default_keepalive")]
    pub keepalive: u64,
    #[serde(default = "default_ping_topic")]
    pub ping_topic: String,
}

/// A duration given as seconds, as text like `"12h"`, or as a table of parts.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DurationSpec {
    Seconds(f64),
    Text(String),
    Parts(DurationParts),
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct DurationParts {
    pub days: f64,
    pub hours: f64,
    pub minutes: f64,
    pub seconds: f64,
}

fn default_poll_secs() -> f64 {
    5.0
}

fn default_poll_retries() -> u32 {
    1
}

fn default_discover_expire() -> DurationSpec {
    DurationSpec::Seconds(12.0 * 3600.0)
}

fn default_slug_separator() -> String {
    "_".to_string()
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_keepalive() -> u64 {
    60
}

fn default_ping_topic() -> String {
    "roku-mqtt/ping".to_string()
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: None,
            username: None,
            password: None,
            cafile: None,
            client_id: None,
            keepalive: default_keepalive(),
            ping_topic: default_ping_topic(),
        }
    }
}

impl MqttConfig {
    pub fn port(&self) -> u16 {
        match (self.port, &self.cafile) {
            (Some(port), _) => port,
            (None, Some(_)) => 8883,
            (None, None) => 1883,
        }
    }
}

impl DurationSpec {
    pub fn to_duration(&self) -> Result<Duration, ConfigError> {
        let secs = match self {
            DurationSpec::Seconds(secs) => *secs,
            DurationSpec::Text(text) => parse_duration_text(text)?,
            DurationSpec::Parts(parts) => {
                parts.days * 86400.0 + parts.hours * 3600.0 + parts.minutes * 60.0 + parts.seconds
            }
        };
        if !secs.is_finite() || secs < 0.0 {
            return Err(ConfigError::InvalidDuration(format!("{:?}", self)));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

/// Parse `"90"`, `"30s"`, `"15m"`, `"12h"` or `"1d"` into seconds
fn parse_duration_text(text: &str) -> Result<f64, ConfigError> {
    let text = text.trim();
    let invalid = || ConfigError::InvalidDuration(text.to_string());
    let split = text
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let value: f64 = number.trim().parse().map_err(|_| invalid())?;
    let scale = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "s" | "sec" | "secs" | "seconds" => 1.0,
        "m" | "min" | "mins" | "minutes" => 60.0,
        "h" | "hr" | "hrs" | "hours" => 3600.0,
        "d" | "day" | "days" => 86400.0,
        _ => return Err(invalid()),
    };
    Ok(value * scale)
}

/// Interpret a loosely-typed on/off value.
///
/// Numbers are true when non-zero; unrecognised text yields `None`.
pub fn parse_flag(value: &str) -> Option<bool> {
    let value = value.trim().to_lowercase();
    if let Ok(number) = value.parse::<f64>() {
        return Some(number != 0.0);
    }
    match value.as_str() {
        "true" | "on" | "y" | "yes" => Some(true),
        "false" | "off" | "n" | "no" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !SLUG_SEPARATORS.contains(&self.slug_separator.as_str()) {
            return Err(ConfigError::InvalidSeparator(self.slug_separator.clone()));
        }
        for (name, value) in [("poll_active", self.poll_active), ("poll_idle", self.poll_idle)] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::InvalidPollInterval { name, value });
            }
        }
        self.discover_expire.to_duration()?;
        Ok(())
    }

    pub fn poll_active_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_active)
    }

    pub fn poll_idle_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_idle)
    }

    pub fn discover_expire(&self) -> Duration {
        // validated on load
        self.discover_expire
            .to_duration()
            .unwrap_or(Duration::from_secs(12 * 3600))
    }

    /// Default tracing directive for the configured verbosity
    pub fn log_directive(&self) -> &'static str {
        if self.debug {
            "roku_mqttd=trace"
        } else if self.verbose {
            "roku_mqttd=debug"
        } else {
            "roku_mqttd=info"
        }
    }
}
