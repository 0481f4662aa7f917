//! Configuration for mbox-split
//!
//! Values are layered, lowest precedence first: serde defaults, an optional
//! TOML file, then `MBOX_SPLIT__*` environment variables. The CLI applies
//! its flags on top before calling [`Config::split_config`].

use crate::error::{Result, SplitError};
use crate::utils::durable::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix for environment overrides, e.g. `MBOX_SPLIT__MESSAGES_PER_PART=500`
pub const ENV_PREFIX: &str = "MBOX_SPLIT";

/// Log file written next to the parts
pub const LOG_FILE: &str = "split.log";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// MBOX archive to split
    #[serde(default)]
    pub input_path: Option<PathBuf>,
    /// Directory receiving parts, checkpoint and log
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Messages per part file
    #[serde(default = "default_messages_per_part")]
    pub messages_per_part: i64,
    /// Messages between two checkpoints
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: i64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Also append logs to `split.log` in the output directory
    #[serde(default = "default_log_file")]
    pub log_file: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Pretty
    }
}

/// Validated settings consumed by the split controller
#[derive(Debug, Clone)]
pub struct SplitConfig {
    pub input_path: PathBuf,
    pub output_dir: PathBuf,
    pub messages_per_part: u64,
    pub checkpoint_interval: u64,
    pub retry: RetryPolicy,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("split_output")
}

fn default_messages_per_part() -> i64 {
    1000
}

fn default_checkpoint_interval() -> i64 {
    100
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    50
}

fn default_max_backoff_ms() -> u64 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            attempts: default_retry_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: LogFormat::default(),
            log_file: default_log_file(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            input_path: None,
            output_dir: default_output_dir(),
            messages_per_part: default_messages_per_part(),
            checkpoint_interval: default_checkpoint_interval(),
            retry: RetryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file and the environment
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = file {
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize::<Config>())
            .map_err(|e| SplitError::InvalidConfiguration(e.to_string()))
    }

    /// Validate and convert into the controller's settings
    pub fn split_config(&self) -> Result<SplitConfig> {
        let input_path = self
            .input_path
            .clone()
            .ok_or_else(|| SplitError::InvalidConfiguration("input_path is required".to_string()))?;

        let messages_per_part = positive("messages_per_part", self.messages_per_part)?;
        let checkpoint_interval = positive("checkpoint_interval", self.checkpoint_interval)?;

        if self.retry.attempts == 0 {
            return Err(SplitError::InvalidConfiguration(
                "retry.attempts must be at least 1".to_string(),
            ));
        }

        Ok(SplitConfig {
            input_path,
            output_dir: self.output_dir.clone(),
            messages_per_part,
            checkpoint_interval,
            retry: self.retry.policy(),
        })
    }

    /// Path of the log file, when file logging is enabled
    pub fn log_file_path(&self) -> Option<PathBuf> {
        self.logging
            .log_file
            .then(|| self.output_dir.join(LOG_FILE))
    }
}

impl SplitConfig {
    /// Settings with default checkpoint interval and retry policy
    pub fn new(input_path: impl Into<PathBuf>, output_dir: impl Into<PathBuf>, messages_per_part: u64) -> Self {
        SplitConfig {
            input_path: input_path.into(),
            output_dir: output_dir.into(),
            messages_per_part,
            checkpoint_interval: default_checkpoint_interval() as u64,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_checkpoint_interval(mut self, interval: u64) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.messages_per_part == 0 {
            return Err(SplitError::InvalidConfiguration(
                "messages_per_part must be at least 1".to_string(),
            ));
        }
        if self.checkpoint_interval == 0 {
            return Err(SplitError::InvalidConfiguration(
                "checkpoint_interval must be at least 1".to_string(),
            ));
        }
        if self.retry.attempts == 0 {
            return Err(SplitError::InvalidConfiguration(
                "retry.attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn positive(name: &str, value: i64) -> Result<u64> {
    if value < 1 {
        return Err(SplitError::InvalidConfiguration(format!(
            "{} must be at least 1, got {}",
            name, value
        )));
    }
    Ok(value as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();

        assert_eq!(config.output_dir, PathBuf::from("split_output"));
        assert_eq!(config.messages_per_part, 1000);
        assert_eq!(config.checkpoint_interval, 100);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.logging.log_file);
    }

    #[test]
    fn test_split_config_requires_input() {
        let err = Config::default().split_config().unwrap_err();
        assert!(matches!(err, SplitError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_zero_and_negative_capacity_rejected() {
        for capacity in [0, -1, -1000] {
            let config = Config {
                input_path: Some(PathBuf::from("inbox.mbox")),
                messages_per_part: capacity,
                ..Config::default()
            };
            let err = config.split_config().unwrap_err();
            assert!(matches!(err, SplitError::InvalidConfiguration(_)), "capacity {capacity}");
        }
    }

    #[test]
    fn test_split_config_conversion() {
        let config = Config {
            input_path: Some(PathBuf::from("inbox.mbox")),
            output_dir: PathBuf::from("out"),
            messages_per_part: 250,
            checkpoint_interval: 10,
            ..Config::default()
        };
        let split = config.split_config().unwrap();

        assert_eq!(split.messages_per_part, 250);
        assert_eq!(split.checkpoint_interval, 10);
        assert_eq!(split.retry.initial_backoff, Duration::from_millis(50));
        assert!(split.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("split.toml");
        std::fs::write(
            &path,
            r#"
input_path = "/var/mail/archive.mbox"
output_dir = "/srv/parts"
messages_per_part = 500

[retry]
attempts = 3

[logging]
format = "json"
log_file = false
"#,
        )
        .unwrap();

        let config = Config::load(Some(path.as_path())).unwrap();

        assert_eq!(config.input_path, Some(PathBuf::from("/var/mail/archive.mbox")));
        assert_eq!(config.output_dir, PathBuf::from("/srv/parts"));
        assert_eq!(config.messages_per_part, 500);
        assert_eq!(config.checkpoint_interval, 100);
        assert_eq!(config.retry.attempts, 3);
        assert_eq!(config.retry.max_backoff_ms, 2000);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.log_file_path().is_none());
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let err = Config::load(Some(dir.path().join("absent.toml").as_path())).unwrap_err();
        assert!(matches!(err, SplitError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_split_config_validate_rejects_zero_interval() {
        let split = SplitConfig::new("in.mbox", "out", 10).with_checkpoint_interval(0);
        assert!(split.validate().is_err());
    }
}
