//! Engine settings loaded from TOML with environment overrides.
//!
//! ```toml
//! [retry]
//! base_delay_ms = 250
//! max_delay_ms = 10000
//! jitter_percent = 10
//!
//! [logging]
//! level = "debug"
//! thread_ids = true
//! ```
//!
//! Any key can be overridden with `ITERFLOW__<SECTION>__<KEY>`, for example
//! `ITERFLOW__RETRY__BASE_DELAY_MS=50`.

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::{LogLevel, LoggingConfig};
use crate::orchestrator::RetryBackoff;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "ITERFLOW";

/// Errors that can occur when loading engine settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file was not found.
    #[error("settings file not found: {0}")]
    FileNotFound(String),

    /// The settings could not be parsed.
    #[error("failed to parse settings: {0}")]
    Parse(#[from] ConfigError),

    /// The settings could not be rendered as TOML.
    #[error("failed to render settings: {0}")]
    Render(#[from] toml::ser::Error),

    /// The settings file path is invalid.
    #[error("invalid settings path: {0}")]
    InvalidPath(String),
}

/// Backoff between attempts under the `retry` error strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Percentage of jitter applied to each delay (0-100)
    pub jitter_percent: u8,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter_percent: 10,
        }
    }
}

impl RetrySettings {
    /// Backoff allowing `retries` re-executions per claim.
    pub fn backoff(&self, retries: u32) -> RetryBackoff {
        RetryBackoff::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            retries,
            self.jitter_percent,
        )
    }
}

/// Subscriber options used by [`EngineSettings::init_logging`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: LogLevel,
    pub timestamps: bool,
    pub target: bool,
    pub thread_ids: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            timestamps: true,
            target: true,
            thread_ids: false,
        }
    }
}

impl From<&LoggingSettings> for LoggingConfig {
    fn from(settings: &LoggingSettings) -> Self {
        LoggingConfig::new()
            .with_level(settings.level)
            .with_timestamps(settings.timestamps)
            .with_target(settings.target)
            .with_thread_ids(settings.thread_ids)
    }
}

/// Process-wide engine settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub retry: RetrySettings,
    pub logging: LoggingSettings,
}

impl EngineSettings {
    /// Load settings from a TOML file, then apply `ITERFLOW__SECTION__KEY` overrides.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use iterflow::settings::EngineSettings;
    ///
    /// let settings = EngineSettings::load("iterflow.toml")?;
    /// settings.init_logging();
    /// # Ok::<(), iterflow::settings::SettingsError>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    fn load_with_prefix<P: AsRef<Path>>(path: P, prefix: &str) -> Result<Self, SettingsError> {
        let path = path.as_ref();

        let path_str = path
            .to_str()
            .ok_or_else(|| SettingsError::InvalidPath(format!("{:?}", path)))?;

        if !path.exists() {
            return Err(SettingsError::FileNotFound(path_str.to_string()));
        }

        let config = Config::builder()
            .add_source(File::new(path_str, FileFormat::Toml))
            .add_source(
                Environment::with_prefix(prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Parse settings from TOML text. No environment overrides are applied.
    pub fn from_toml_str(text: &str) -> Result<Self, SettingsError> {
        let config = Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Render the settings as TOML, e.g. to write a starter file.
    pub fn to_toml_string(&self) -> Result<String, SettingsError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Install the stderr subscriber described by the `logging` section.
    pub fn init_logging(&self) -> bool {
        crate::logging::init_logging(LoggingConfig::from(&self.logging))
    }
}
