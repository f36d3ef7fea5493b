//! Configuration loading for the A2A relay.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Environment variable overriding the shared secret.
pub const ENV_SHARED_SECRET: &str = "A2A_SHARED_SECRET";
/// Environment variable overriding the log level.
pub const ENV_LOG_LEVEL: &str = "A2A_LOG_LEVEL";
/// Environment variable overriding the default message TTL.
pub const ENV_MESSAGE_TTL: &str = "A2A_MESSAGE_TTL_SECS";

/// Get the default settings file path (platform config dir).
pub fn get_settings_path() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("com", "a2a-relay", "a2a-relay")
        .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;

    Ok(dirs.config_dir().join("settings.json"))
}

/// Load settings from `path` (or the default location), then apply
/// environment overrides and validate.
///
/// A missing file is not an error; defaults plus environment are used.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => get_settings_path()?,
    };

    let mut settings = if path.exists() {
        let content = std::fs::read_to_string(&path)?;
        let settings: Settings = serde_json::from_str(&content)?;
        tracing::debug!("Loaded settings from {}", path.display());
        settings
    } else {
        tracing::debug!("No settings file at {}, using defaults", path.display());
        Settings::default()
    };

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok())?;
    validate_settings(&settings)?;
    Ok(settings)
}

fn apply_env_overrides(
    settings: &mut Settings,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(secret) = lookup(ENV_SHARED_SECRET) {
        settings.a2a_shared_secret = secret;
    }
    if let Some(level) = lookup(ENV_LOG_LEVEL) {
        settings.log_level = level;
    }
    if let Some(ttl) = lookup(ENV_MESSAGE_TTL) {
        settings.message_ttl_secs = ttl.parse().map_err(|_| {
            Error::Config(format!("{} must be an integer, got '{}'", ENV_MESSAGE_TTL, ttl))
        })?;
    }
    Ok(())
}

fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.a2a_shared_secret.is_empty() {
        return Err(Error::Config(format!(
            "a2a_shared_secret is empty; set it in the settings file or {}",
            ENV_SHARED_SECRET
        )));
    }
    if settings.history_limit == 0 {
        return Err(Error::Config("history_limit must be at least 1".to_string()));
    }
    Ok(())
}

/// Relay settings.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Settings {
    /// Shared secret for envelope signing
    #[serde(default)]
    pub a2a_shared_secret: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines instead of human-readable ones
    #[serde(default)]
    pub log_json: bool,

    /// Also write daily-rolling log files here
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    #[serde(default = "default_message_ttl_secs")]
    pub message_ttl_secs: u64,

    #[serde(default = "default_priority")]
    pub default_priority: i32,

    /// Sent envelopes kept for history queries
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,

    /// 0 disables the background state sweeper
    #[serde(default)]
    pub state_sweep_interval_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_message_ttl_secs() -> u64 {
    crate::protocol::types::DEFAULT_TTL_SECS
}

fn default_priority() -> i32 {
    crate::protocol::types::DEFAULT_PRIORITY
}

fn default_history_limit() -> usize {
    crate::protocol::transport::DEFAULT_HISTORY_LIMIT
}

fn default_receive_timeout_ms() -> u64 {
    5000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            a2a_shared_secret: String::new(),
            log_level: default_log_level(),
            log_json: false,
            log_dir: None,
            message_ttl_secs: default_message_ttl_secs(),
            default_priority: default_priority(),
            history_limit: default_history_limit(),
            receive_timeout_ms: default_receive_timeout_ms(),
            state_sweep_interval_secs: 0,
        }
    }
}

impl Settings {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn state_sweep_interval(&self) -> Option<Duration> {
        (self.state_sweep_interval_secs > 0)
            .then(|| Duration::from_secs(self.state_sweep_interval_secs))
    }
}
