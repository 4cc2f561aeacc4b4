//! Configuration parsing and structures

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::env::expand_env;

/// Descriptor directory used when the configuration does not name one
pub const DEFAULT_MOUNTABLE_DIR: &str = "/usr/share/gvfs/mounts";

/// Identity the daemon announces on the bus when none is configured
pub const DEFAULT_UNIQUE_NAME: &str = ":1.0";

/// Bus socket used when the configuration does not name one
pub const DEFAULT_BUS_SOCKET: &str = "/tmp/mount-tracker/bus.sock";

// =============================================================================
// Raw Config (Deserialized from YAML)
// =============================================================================

/// Raw configuration as deserialized from YAML.
/// This is converted to `Config` via `resolve()`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Mountable descriptor location
    #[serde(default)]
    pub mountables: RawMountablesConfig,

    /// Backend spawn handshake settings
    #[serde(default)]
    pub spawn: SpawnConfig,

    /// Bus identity settings
    #[serde(default)]
    pub bus: RawBusConfig,
}

/// Mountable descriptor section before env expansion
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawMountablesConfig {
    /// Directory holding descriptor files; may reference `${VAR}`s
    pub dir: Option<String>,
}

/// Bus section before defaults are applied
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawBusConfig {
    /// Unique connection name of the daemon
    pub unique_name: Option<String>,

    /// Unix socket peers connect to; may reference `${VAR}`s
    pub socket: Option<String>,
}

/// Spawn handshake configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SpawnConfig {
    /// How long to wait for a spawned backend to acknowledge (e.g. "30s").
    /// Unset means wait indefinitely.
    #[serde(default)]
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

// =============================================================================
// Resolved Config (Ready for use)
// =============================================================================

/// Top-level configuration (resolved from RawConfig)
#[derive(Debug, Clone)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Directory holding mountable descriptor files
    pub mountable_dir: PathBuf,

    /// Spawn handshake settings
    pub spawn: SpawnConfig,

    /// Unique connection name of the daemon
    pub unique_name: String,

    /// Unix socket peers connect to
    pub socket_path: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
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
            logging: LoggingConfig::default(),
            mountable_dir: PathBuf::from(DEFAULT_MOUNTABLE_DIR),
            spawn: SpawnConfig::default(),
            unique_name: DEFAULT_UNIQUE_NAME.to_string(),
            socket_path: PathBuf::from(DEFAULT_BUS_SOCKET),
        }
    }
}

// =============================================================================
// Resolution Logic
// =============================================================================

impl RawConfig {
    /// Resolve raw config into final config, expanding env references and
    /// filling in defaults
    pub fn resolve(self) -> Result<Config, ConfigError> {
        let RawConfig {
            logging,
            mountables,
            spawn,
            bus,
        } = self;

        let mountable_dir = match mountables.dir {
            Some(dir) => PathBuf::from(expand_env(&dir)?),
            None => PathBuf::from(DEFAULT_MOUNTABLE_DIR),
        };

        let socket_path = match bus.socket {
            Some(socket) => PathBuf::from(expand_env(&socket)?),
            None => PathBuf::from(DEFAULT_BUS_SOCKET),
        };

        Ok(Config {
            logging,
            mountable_dir,
            spawn,
            unique_name: bus
                .unique_name
                .unwrap_or_else(|| DEFAULT_UNIQUE_NAME.to_string()),
            socket_path,
        })
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.clone(), e.to_string()))?;

        Self::from_str(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        raw.resolve()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mountable_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "mountables.dir cannot be empty".to_string(),
            ));
        }

        if self.spawn.timeout == Some(Duration::ZERO) {
            return Err(ConfigError::ValidationError(
                "spawn.timeout must be greater than zero (omit it to wait indefinitely)"
                    .to_string(),
            ));
        }

        if self.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "bus.socket cannot be empty".to_string(),
            ));
        }

        if !self.unique_name.starts_with(':') {
            return Err(ConfigError::ValidationError(format!(
                "bus.unique_name {:?} is not a unique connection name",
                self.unique_name
            )));
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
logging:
  level: debug

mountables:
  dir: /opt/vfs/mounts

spawn:
  timeout: 30s

bus:
  unique_name: ":1.7"
  socket: /run/user/1000/mount-tracker.sock
"#;

        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.mountable_dir, PathBuf::from("/opt/vfs/mounts"));
        assert_eq!(config.spawn.timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.unique_name, ":1.7");
        assert_eq!(
            config.socket_path,
            PathBuf::from("/run/user/1000/mount-tracker.sock")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = Config::from_str("{}").unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.mountable_dir, PathBuf::from(DEFAULT_MOUNTABLE_DIR));
        assert_eq!(config.spawn.timeout, None);
        assert_eq!(config.unique_name, DEFAULT_UNIQUE_NAME);
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_BUS_SOCKET));
    }

    #[test]
    fn test_mountable_dir_expands_env() {
        std::env::set_var("MOUNT_TRACKER_CFG_TEST_ROOT", "/data");
        let yaml = r#"
mountables:
  dir: "${MOUNT_TRACKER_CFG_TEST_ROOT}/mounts"
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.mountable_dir, PathBuf::from("/data/mounts"));
        std::env::remove_var("MOUNT_TRACKER_CFG_TEST_ROOT");
    }

    #[test]
    fn test_missing_env_var_is_an_error() {
        let yaml = r#"
mountables:
  dir: "${MOUNT_TRACKER_CFG_TEST_UNSET_12345}/mounts"
"#;
        let err = Config::from_str(yaml).unwrap_err();
        assert!(
            err.to_string().contains("MOUNT_TRACKER_CFG_TEST_UNSET_12345"),
            "Error should name the missing variable: {}",
            err
        );
    }

    #[test]
    fn test_validate_zero_timeout() {
        let mut config = Config::default();
        config.spawn.timeout = Some(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_socket() {
        let mut config = Config::default();
        config.socket_path = PathBuf::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_well_known_name_rejected() {
        let mut config = Config::default();
        config.unique_name = "org.gtk.vfs.Daemon".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_error() {
        let result = Config::from_str("spawn: 42");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }
}
