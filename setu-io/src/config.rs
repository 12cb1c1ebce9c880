//! Configuration for the SetuIO daemon
//!
//! Loads configuration from a TOML file. Every section has defaults, so a
//! file only needs the keys it changes.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub serial: SerialConfig,
    pub router: RouterConfig,
    pub parameters: ParametersConfig,
    pub legacy: LegacyConfig,
    pub logging: LoggingConfig,
}

/// Flight-controller serial link
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Serial port path (e.g. `/dev/ttyACM0`)
    pub port: String,
    pub baudrate: u32,
    /// How long `connect` waits for the first heartbeat
    pub handshake_timeout_ms: u64,
    /// Connect at startup instead of waiting for an API call
    pub auto_connect: bool,
    /// Consecutive read failures before the link is declared dead
    pub max_consecutive_errors: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baudrate: 115_200,
            handshake_timeout_ms: 10_000,
            auto_connect: false,
            max_consecutive_errors: 10,
        }
    }
}

/// Router persistence
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RouterConfig {
    /// JSON file holding the configured outputs
    pub outputs_file: PathBuf,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            outputs_file: PathBuf::from("/var/lib/setu-io/outputs.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ParametersConfig {
    /// Per-parameter echo timeout
    pub timeout_ms: u64,
}

impl Default for ParametersConfig {
    fn default() -> Self {
        Self { timeout_ms: 3_000 }
    }
}

/// Inline TCP listener attached directly to the serial link
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LegacyConfig {
    pub enabled: bool,
    /// Examples:
    /// - `0.0.0.0:5760` - all interfaces
    /// - `127.0.0.1:5760` - localhost only
    pub bind_address: String,
}

impl Default for LegacyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: "0.0.0.0:5760".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` overrides it
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from TOML file
    ///
    /// # Example
    /// ```no_run
    /// use setu_io::config::AppConfig;
    ///
    /// let config = AppConfig::from_file("setu-io.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.serial.handshake_timeout_ms)
    }

    pub fn param_timeout(&self) -> Duration {
        Duration::from_millis(self.parameters.timeout_ms)
    }

    /// Legacy listener address, if enabled
    pub fn legacy_listener(&self) -> Option<String> {
        self.legacy
            .enabled
            .then(|| self.legacy.bind_address.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.serial.baudrate, 115_200);
        assert_eq!(config.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(config.param_timeout(), Duration::from_secs(3));
        assert_eq!(config.serial.max_consecutive_errors, 10);
        assert!(config.legacy_listener().is_none());
    }

    #[test]
    fn test_toml_serialization() {
        let config = AppConfig::default();
        let toml_string = toml::to_string_pretty(&config).unwrap();

        assert!(toml_string.contains("[serial]"));
        assert!(toml_string.contains("[router]"));
        assert!(toml_string.contains("[parameters]"));
        assert!(toml_string.contains("[legacy]"));
        assert!(toml_string.contains("[logging]"));
        assert!(toml_string.contains("baudrate = 115200"));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let toml_content = r#"
[serial]
port = "/dev/ttyUSB0"
baudrate = 57600

[legacy]
enabled = true
"#;

        let config: AppConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.serial.port, "/dev/ttyUSB0");
        assert_eq!(config.serial.baudrate, 57_600);
        assert_eq!(config.serial.handshake_timeout_ms, 10_000);
        assert_eq!(config.legacy_listener().as_deref(), Some("0.0.0.0:5760"));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("setu-io.toml");

        let mut config = AppConfig::default();
        config.parameters.timeout_ms = 1_500;
        config.router.outputs_file = dir.path().join("outputs.json");
        config.to_file(&path).unwrap();

        let loaded = AppConfig::from_file(&path).unwrap();
        assert_eq!(loaded.parameters.timeout_ms, 1_500);
        assert_eq!(loaded.router.outputs_file, dir.path().join("outputs.json"));
    }
}
