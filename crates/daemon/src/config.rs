//! Configuration management for the termrooms daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termrooms/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::filter::{default_rules, FilterRule, OutputFilter};
use crate::session::{DrainSettings, DriverDefaults, RegistrySettings, RemoteSettings};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("capacity must be between 1 and 1000, got {0}")]
    InvalidCapacity(usize),

    #[error("chunk_size must be greater than 0, got {0}")]
    InvalidChunkSize(usize),

    #[error("read_timeout_ms must be between 1 and 1000, got {0}")]
    InvalidReadTimeout(u64),

    #[error("login_timeout_ms must be greater than 0, got {0}")]
    InvalidLoginTimeout(u64),

    #[error("default_command not found: {0}")]
    InvalidDefaultCommand(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Upper bound on the registry capacity.
const MAX_CAPACITY: usize = 1000;

/// Main configuration structure for the termrooms daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Session and registry configuration.
    pub session: SessionConfig,

    /// Remote (ssh) driver configuration.
    pub remote: RemoteConfig,

    /// Output filter rules.
    pub filter: FilterConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for daemon state.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Also write logs to this file, rotated daily.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum number of sessions held at once.
    pub capacity: usize,

    /// Program run by local sessions that do not name one.
    pub default_command: String,

    /// Arguments for `default_command`.
    pub default_args: Vec<String>,

    /// Lines sent to every session right after it starts.
    pub startup_commands: Vec<String>,

    /// Reclaim the oldest stopped session when the registry is full.
    pub evict_stopped: bool,

    /// Maximum bytes read from a driver at once.
    pub chunk_size: usize,

    /// How long one read may wait for output.
    pub read_timeout_ms: u64,

    /// Pause between reads when a session is idle.
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RemoteConfig {
    /// ssh client binary.
    pub ssh_program: String,

    /// How long a remote login may take.
    pub login_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FilterConfig {
    /// Applied to every chunk, in order.
    pub rules: Vec<FilterRule>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            capacity: 32,
            default_command: default_command(),
            default_args: Vec::new(),
            startup_commands: Vec::new(),
            evict_stopped: true,
            chunk_size: 4096,
            read_timeout_ms: 10,
            poll_interval_ms: 50,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            login_timeout_ms: 15_000,
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            rules: default_rules(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termrooms")
        .join("config.toml")
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termrooms")
}

fn default_command() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMROOMS_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - TERMROOMS_CAPACITY: Override the session capacity
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("TERMROOMS_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(capacity) = std::env::var("TERMROOMS_CAPACITY") {
            if !capacity.is_empty() {
                match capacity.parse::<usize>() {
                    Ok(value) => {
                        tracing::info!("Overriding capacity from environment: {}", value);
                        self.session.capacity = value;
                    }
                    Err(_) => {
                        tracing::warn!("Ignoring non-numeric TERMROOMS_CAPACITY: {}", capacity);
                    }
                }
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.capacity < 1 || self.session.capacity > MAX_CAPACITY {
            return Err(ConfigError::InvalidCapacity(self.session.capacity));
        }

        if self.session.chunk_size == 0 {
            return Err(ConfigError::InvalidChunkSize(self.session.chunk_size));
        }

        if self.session.read_timeout_ms == 0 || self.session.read_timeout_ms > 1000 {
            return Err(ConfigError::InvalidReadTimeout(self.session.read_timeout_ms));
        }

        if self.remote.login_timeout_ms == 0 {
            return Err(ConfigError::InvalidLoginTimeout(self.remote.login_timeout_ms));
        }

        let command = Path::new(&self.session.default_command);
        let resolvable = if command.is_absolute() {
            command.exists()
        } else {
            which::which(&self.session.default_command).is_ok()
        };
        if !resolvable {
            return Err(ConfigError::InvalidDefaultCommand(
                self.session.default_command.clone(),
            ));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Registry settings derived from the `[session]` section.
    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            capacity: self.session.capacity,
            evict_stopped: self.session.evict_stopped,
            startup_commands: self.session.startup_commands.clone(),
            drain: DrainSettings {
                chunk_size: self.session.chunk_size,
                read_timeout: Duration::from_millis(self.session.read_timeout_ms),
                poll_interval: Duration::from_millis(self.session.poll_interval_ms),
            },
        }
    }

    /// Driver defaults derived from the `[session]` and `[remote]` sections.
    pub fn driver_defaults(&self) -> DriverDefaults {
        DriverDefaults {
            command: self.session.default_command.clone(),
            args: self.session.default_args.clone(),
            remote: RemoteSettings {
                ssh_program: self.remote.ssh_program.clone(),
                login_timeout: Duration::from_millis(self.remote.login_timeout_ms),
            },
        }
    }

    pub fn output_filter(&self) -> OutputFilter {
        OutputFilter::new(self.filter.rules.clone())
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

    /// Save configuration to a file, creating parent directories as needed.
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
        toml::to_string(self).context("Failed to serialize configuration to TOML")
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

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.session.default_command = "/bin/sh".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert!(config.daemon.log_file.is_none());
        assert_eq!(config.session.capacity, 32);
        assert!(config.session.evict_stopped);
        assert_eq!(config.session.chunk_size, 4096);
        assert_eq!(config.session.read_timeout_ms, 10);
        assert_eq!(config.session.poll_interval_ms, 50);
        assert_eq!(config.remote.ssh_program, "ssh");
        assert_eq!(config.filter.rules, default_rules());
    }

    #[test]
    fn test_default_data_dir() {
        let config = DaemonConfig::default();
        assert!(config.data_dir.to_string_lossy().contains("termrooms"));
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[daemon]
log_level = "debug"

[session]
capacity = 5
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.session.capacity, 5);
        assert_eq!(config.session.chunk_size, 4096);
        assert_eq!(config.filter.rules, default_rules());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
data_dir = "/custom/data"
log_level = "trace"
log_file = "/var/log/termrooms/daemon.log"

[session]
capacity = 20
default_command = "/bin/bash"
default_args = ["--noprofile"]
startup_commands = ["export TERM=dumb"]
evict_stopped = false
chunk_size = 1024
read_timeout_ms = 20
poll_interval_ms = 100

[remote]
ssh_program = "/usr/local/bin/ssh"
login_timeout_ms = 5000

[[filter.rules]]
kind = "replace"
from = "\r"
to = ""
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.daemon.log_level, "trace");
        assert_eq!(
            config.daemon.log_file,
            Some(PathBuf::from("/var/log/termrooms/daemon.log"))
        );
        assert_eq!(config.session.capacity, 20);
        assert_eq!(config.session.default_command, "/bin/bash");
        assert_eq!(config.session.default_args, vec!["--noprofile"]);
        assert_eq!(config.session.startup_commands, vec!["export TERM=dumb"]);
        assert!(!config.session.evict_stopped);
        assert_eq!(config.session.chunk_size, 1024);
        assert_eq!(config.session.read_timeout_ms, 20);
        assert_eq!(config.session.poll_interval_ms, 100);
        assert_eq!(config.remote.ssh_program, "/usr/local/bin/ssh");
        assert_eq!(config.remote.login_timeout_ms, 5000);
        assert_eq!(config.filter.rules, vec![FilterRule::replace("\r", "")]);
    }

    #[test]
    fn test_empty_filter_rules_mean_passthrough() {
        let config = Config::from_toml("[filter]\nrules = []\n").unwrap();
        assert_eq!(config.output_filter().apply("a\r\nb"), "a\r\nb");
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[daemon
log_level = "debug"
"#;
        let result = Config::from_toml(toml);
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[session]
capacity = "not a number"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_from_toml_unknown_filter_kind() {
        let toml = r#"
[[filter.rules]]
kind = "regex"
pattern = ".*"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let toml = r#"
[daemon]
log_level = "warn"
colour = "blue"

[extra]
anything = 1
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.daemon.log_level, "warn");
    }

    #[test]
    fn test_roundtrip() {
        let original = Config::default();
        let toml = original.to_toml().unwrap();
        let loaded = Config::from_toml(&toml).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_to_toml_sections() {
        let toml = Config::default().to_toml().unwrap();
        assert!(toml.contains("[daemon]"));
        assert!(toml.contains("[session]"));
        assert!(toml.contains("[remote]"));
        assert!(toml.contains("[[filter.rules]]"));
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load(temp_dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = valid_config();
        config.session.capacity = 7;
        config.session.startup_commands = vec!["stty -echo".to_string()];
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "[session]\ncapacity = [").unwrap();

        let err = format!("{:#}", Config::load(&path).unwrap_err());
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("termrooms/config.toml"));
    }

    #[test]
    fn test_registry_settings_conversion() {
        let mut config = valid_config();
        config.session.capacity = 3;
        config.session.evict_stopped = false;
        config.session.read_timeout_ms = 25;

        let settings = config.registry_settings();
        assert_eq!(settings.capacity, 3);
        assert!(!settings.evict_stopped);
        assert_eq!(settings.drain.read_timeout, Duration::from_millis(25));
        assert_eq!(settings.drain.poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_driver_defaults_conversion() {
        let mut config = valid_config();
        config.session.default_args = vec!["-i".to_string()];
        config.remote.login_timeout_ms = 3000;

        let defaults = config.driver_defaults();
        assert_eq!(defaults.command, "/bin/sh");
        assert_eq!(defaults.args, vec!["-i"]);
        assert_eq!(defaults.remote.login_timeout, Duration::from_secs(3));
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::set_var("TERMROOMS_LOG_LEVEL", "debug");
        let mut config = Config::default();
        config.apply_env_overrides();
        std::env::remove_var("TERMROOMS_LOG_LEVEL");

        assert_eq!(config.daemon.log_level, "debug");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("TERMROOMS_LOG_LEVEL", "");
        let mut config = Config::default();
        config.apply_env_overrides();
        std::env::remove_var("TERMROOMS_LOG_LEVEL");

        assert_eq!(config.daemon.log_level, "info");
    }

    #[test]
    #[serial]
    fn test_env_override_capacity() {
        std::env::set_var("TERMROOMS_CAPACITY", "8");
        let mut config = Config::default();
        config.apply_env_overrides();
        std::env::remove_var("TERMROOMS_CAPACITY");

        assert_eq!(config.session.capacity, 8);
    }

    #[test]
    #[serial]
    fn test_env_override_capacity_not_a_number() {
        std::env::set_var("TERMROOMS_CAPACITY", "lots");
        let mut config = Config::default();
        config.apply_env_overrides();
        std::env::remove_var("TERMROOMS_CAPACITY");

        assert_eq!(config.session.capacity, 32);
    }

    #[test]
    #[serial]
    fn test_env_override_unset_does_not_override() {
        std::env::remove_var("TERMROOMS_LOG_LEVEL");
        std::env::remove_var("TERMROOMS_CAPACITY");
        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_validate_default_like_config() {
        assert_eq!(valid_config().validate(), Ok(()));
    }

    #[test]
    fn test_validate_capacity_bounds() {
        let mut config = valid_config();

        config.session.capacity = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidCapacity(0)));

        config.session.capacity = 1001;
        assert_eq!(config.validate(), Err(ConfigError::InvalidCapacity(1001)));

        config.session.capacity = 1;
        assert!(config.validate().is_ok());

        config.session.capacity = 1000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_chunk_size_zero() {
        let mut config = valid_config();
        config.session.chunk_size = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidChunkSize(0)));
    }

    #[test]
    fn test_validate_read_timeout() {
        let mut config = valid_config();
        config.session.read_timeout_ms = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidReadTimeout(0)));

        config.session.read_timeout_ms = 5000;
        assert_eq!(config.validate(), Err(ConfigError::InvalidReadTimeout(5000)));
    }

    #[test]
    fn test_validate_login_timeout_zero() {
        let mut config = valid_config();
        config.remote.login_timeout_ms = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidLoginTimeout(0)));
    }

    #[test]
    fn test_validate_default_command_absolute_missing() {
        let mut config = valid_config();
        config.session.default_command = "/nonexistent/shell/path".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidDefaultCommand(
                "/nonexistent/shell/path".to_string()
            ))
        );
    }

    #[test]
    fn test_validate_default_command_in_path() {
        let mut config = valid_config();
        config.session.default_command = "sh".to_string();
        assert!(config.validate().is_ok());

        config.session.default_command = "definitely-not-a-real-command-xyz".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDefaultCommand(_))
        ));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = valid_config();

        for level in ["trace", "debug", "info", "warn", "error", "DEBUG"] {
            config.daemon.log_level = level.to_string();
            assert!(config.validate().is_ok(), "{} should be valid", level);
        }

        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }
}
