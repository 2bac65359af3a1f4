//! Configuration file parser for ~/.config/feedvault/config.toml.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Durations are written as strings (`"30s"`, `"15m"`, `"2h"`, `"7d"` or bare
//! seconds) and resolved into a validated [`Settings`] before any work starts.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::sync::{SchedulerConfig, DEFAULT_CONCURRENCY};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    /// A value parsed but is out of range or malformed.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// On-disk configuration. Every key is optional.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// SQLite database path. Defaults to `~/.config/feedvault/feedvault.db`.
    pub database: Option<PathBuf>,

    /// Subscription list (OPML or one URL per line) used when `fetch` is
    /// given no feeds on the command line.
    pub subscriptions: Option<PathBuf>,

    /// Number of feeds fetched at once.
    pub concurrency: usize,

    /// Per-feed request timeout.
    pub timeout: String,

    /// Skip feeds fetched more recently than this.
    pub max_age: Option<String>,

    /// Abandon the whole run after this long.
    pub deadline: Option<String>,

    /// After each fetch run, delete items archived longer ago than this.
    pub purge_after: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: None,
            subscriptions: None,
            concurrency: DEFAULT_CONCURRENCY,
            timeout: "30s".to_string(),
            max_age: None,
            deadline: None,
            purge_after: None,
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 7] = [
        "database",
        "subscriptions",
        "concurrency",
        "timeout",
        "max_age",
        "deadline",
        "purge_after",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as a warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }
}

/// `~/.config/feedvault`, or `None` when `HOME` is unset.
pub fn config_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config").join("feedvault"))
}

// ============================================================================
// Resolved Settings
// ============================================================================

/// Validated, typed configuration for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub database: PathBuf,
    pub subscriptions: Option<PathBuf>,
    pub concurrency: usize,
    pub timeout: Duration,
    pub max_age: Option<Duration>,
    pub deadline: Option<Duration>,
    pub purge_after: Option<Duration>,
}

impl Settings {
    /// Parse the duration strings in `config` and validate the result.
    ///
    /// `default_database` is used when the file names no database.
    pub fn resolve(config: &Config, default_database: PathBuf) -> Result<Self, ConfigError> {
        let optional = |value: &Option<String>, key: &str| {
            value
                .as_deref()
                .map(|v| parse_duration(v).map_err(|e| prefix(key, e)))
                .transpose()
        };

        let settings = Settings {
            database: config.database.clone().unwrap_or(default_database),
            subscriptions: config.subscriptions.clone(),
            concurrency: config.concurrency,
            timeout: parse_duration(&config.timeout).map_err(|e| prefix("timeout", e))?,
            max_age: optional(&config.max_age, "max_age")?,
            deadline: optional(&config.deadline, "deadline")?,
            purge_after: optional(&config.purge_after, "purge_after")?,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values that would make a run meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid("timeout must be greater than zero".into()));
        }
        if self.deadline.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::Invalid("deadline must be greater than zero".into()));
        }
        Ok(())
    }

    pub fn scheduler_config(&self, force: bool) -> SchedulerConfig {
        SchedulerConfig {
            concurrency: self.concurrency,
            timeout: self.timeout,
            max_age: self.max_age,
            force,
            deadline: self.deadline,
        }
    }
}

fn prefix(key: &str, err: ConfigError) -> ConfigError {
    match err {
        ConfigError::Invalid(msg) => ConfigError::Invalid(format!("{}: {}", key, msg)),
        other => other,
    }
}

/// Parse `"90"`, `"30s"`, `"15m"`, `"2h"` or `"7d"`.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let s = input.trim();
    let invalid = || ConfigError::Invalid(format!("invalid duration '{}'", input));

    let (number, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    if number.is_empty() {
        return Err(invalid());
    }
    let value: u64 = number.parse().map_err(|_| invalid())?;
    let multiplier: u64 = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        _ => return Err(invalid()),
    };
    value
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(invalid)
}

// ============================================================================
// Tests
// ============================================================================
