//! Configuration loader and validator for the promo engine.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub api: Api,
    #[serde(default)]
    pub notifications: Notifications,
    #[serde(default)]
    pub countdown: CountdownSettings,
}

/// Portal REST API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Api {
    pub base_url: String,
    pub token: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// Notification polling and push settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notifications {
    pub poll_interval_secs: u64,
    pub push_ack_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CountdownSettings {
    pub tick_ms: u64,
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl Default for Notifications {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            push_ack_timeout_ms: 5_000,
        }
    }
}

impl Default for CountdownSettings {
    fn default() -> Self {
        Self { tick_ms: 1_000 }
    }
}

impl Notifications {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn push_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.push_ack_timeout_ms)
    }
}

impl CountdownSettings {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    let base_url = cfg.api.base_url.trim();
    if base_url.is_empty() {
        return Err(ConfigError::Invalid("api.base_url must be non-empty"));
    }
    if reqwest::Url::parse(base_url).is_err() {
        return Err(ConfigError::Invalid("api.base_url must be an absolute URL"));
    }
    if !base_url.ends_with('/') {
        // Url::join would drop the last path segment.
        return Err(ConfigError::Invalid("api.base_url must end with '/'"));
    }
    if cfg.api.token.trim().is_empty() {
        return Err(ConfigError::Invalid("api.token must be non-empty"));
    }
    if cfg.api.timeout_ms == 0 {
        return Err(ConfigError::Invalid("api.timeout_ms must be > 0"));
    }
    if cfg.notifications.poll_interval_secs == 0 {
        return Err(ConfigError::Invalid("notifications.poll_interval_secs must be > 0"));
    }
    if cfg.notifications.push_ack_timeout_ms == 0 {
        return Err(ConfigError::Invalid("notifications.push_ack_timeout_ms must be > 0"));
    }
    if cfg.countdown.tick_ms == 0 {
        return Err(ConfigError::Invalid("countdown.tick_ms must be > 0"));
    }
    Ok(())
}

/// Returns a complete sample configuration.
pub fn example() -> &'static str {
    r#"api:
  base_url: "https://portal.example.com/api/"
  token: "YOUR_PORTAL_API_TOKEN"
  timeout_ms: 10000

notifications:
  poll_interval_secs: 30
  push_ack_timeout_ms: 5000

countdown:
  tick_ms: 1000
"#
}
