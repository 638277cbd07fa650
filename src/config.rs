//! Configuration management for Sinapsi
//!
//! This module handles loading, validation, and management of the application
//! configuration from YAML files. Device constants that the meter requires
//! (port, unit id, pacing) carry fixed defaults but stay overridable for
//! bench setups.

use crate::controller::{ControllerMode, Load, parse_loads};
use crate::decode::WordOrder;
use crate::error::{Result, SinapsiError};
use crate::modbus::AddressBase;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Lower bound applied to every poll interval
pub const MIN_POLL_INTERVAL_MS: u64 = 500;

/// Cadence of the KNX load-control pin output
pub const KNX_LOAD_CONTROL_PIN_INTERVAL_MS: u64 = 10_000;

fn default_true() -> bool {
    true
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Meter connection
    pub device: DeviceConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Telemetry publisher
    pub telemetry: TelemetryConfig,

    /// Load controller
    pub controller: ControllerConfig,
}

/// Modbus TCP connection parameters for the meter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Hostname or IP address of the meter
    pub host: String,

    /// TCP port (the meter listens on 502)
    pub port: u16,

    /// Modbus unit identifier
    pub unit_id: u8,

    /// Connect timeout in milliseconds
    pub timeout_ms: u64,

    /// Constant delay between reconnect attempts in milliseconds
    pub reconnect_interval_ms: u64,

    /// Pause inserted after every queued register operation
    pub queue_delay_ms: u64,

    /// Whether configured addresses are 0-based or 1-based
    pub base_address: AddressBase,

    /// Word order of 32-bit registers
    pub word_order: WordOrder,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Optional console-specific level
    pub console_level: Option<String>,

    /// Optional file-specific level
    pub file_level: Option<String>,

    /// Path to log file (its directory receives the rotated files)
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

/// Output compatibility of the telemetry publisher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TelemetryCompatibility {
    /// Full telemetry messages
    #[default]
    Telemetry,
    /// Only the periodic shed/unshed pin for KNX load control actuators
    KnxLoadControlPin,
}

/// Telemetry publisher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Whether the publisher runs at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Poll interval in milliseconds
    pub poll_interval_ms: u64,

    /// Suppress payloads identical to the previously published one
    pub send_on_change: bool,

    /// Output compatibility
    pub compatibility: TelemetryCompatibility,
}

/// Load controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Whether the controller runs at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Control loop interval in milliseconds
    pub poll_interval_ms: u64,

    /// Active policies
    pub mode: ControllerMode,

    /// Export power kept back from surplus enabling
    pub surplus_reserve_w: f64,

    /// Extra headroom allowed when enabling on surplus
    pub surplus_hysteresis_w: f64,

    /// Import limit of the supply contract
    pub max_import_w: f64,

    /// Shedding continues until import drops this far below the limit
    pub import_hysteresis_w: f64,

    /// Force every load off while the meter announces a supply cutoff
    pub force_off_on_cutoff: bool,

    /// Load list, either a YAML sequence or a JSON string
    pub loads: serde_json::Value,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 502,
            unit_id: 1,
            timeout_ms: 1000,
            reconnect_interval_ms: 2000,
            queue_delay_ms: 1,
            base_address: AddressBase::Zero,
            word_order: WordOrder::HiLo,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            console_level: None,
            file_level: None,
            file: "/tmp/sinapsi.log".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 2000,
            send_on_change: false,
            compatibility: TelemetryCompatibility::Telemetry,
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 2000,
            mode: ControllerMode::Both,
            surplus_reserve_w: 200.0,
            surplus_hysteresis_w: 100.0,
            max_import_w: 3000.0,
            import_hysteresis_w: 150.0,
            force_off_on_cutoff: true,
            loads: serde_json::Value::Array(Vec::new()),
        }
    }
}

impl DeviceConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn queue_delay(&self) -> Duration {
        Duration::from_millis(self.queue_delay_ms)
    }

    /// Validate only the connection section
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(SinapsiError::validation(
                "device.host",
                "Host cannot be empty",
            ));
        }

        if self.port == 0 {
            return Err(SinapsiError::validation(
                "device.port",
                "Port must be greater than 0",
            ));
        }

        if self.timeout_ms == 0 {
            return Err(SinapsiError::validation(
                "device.timeout_ms",
                "Must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl TelemetryConfig {
    /// Effective poll interval, clamped and capped for the KNX pin cadence
    pub fn poll_interval(&self) -> Duration {
        let mut ms = self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS);
        if self.compatibility == TelemetryCompatibility::KnxLoadControlPin {
            ms = ms.min(KNX_LOAD_CONTROL_PIN_INTERVAL_MS);
        }
        Duration::from_millis(ms)
    }
}

impl ControllerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
    }

    /// Parsed load definitions; malformed input yields an empty list
    pub fn load_definitions(&self) -> Vec<Load> {
        parse_loads(&self.loads)
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from `SINAPSI_CONFIG` or the default locations
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("SINAPSI_CONFIG") {
            return Self::from_file(path);
        }

        let default_paths = [
            "sinapsi_config.yaml",
            "/data/sinapsi_config.yaml",
            "/etc/sinapsi/config.yaml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        // Fall back to default configuration
        Ok(Config::default())
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Validate the configuration.
    ///
    /// Only the device section can make the configuration unusable; see
    /// [`Config::warnings`] for values that are clamped instead.
    pub fn validate(&self) -> Result<()> {
        self.device.validate()
    }

    /// Controller tunables that will be clamped to zero when applied
    pub fn warnings(&self) -> Vec<String> {
        let c = &self.controller;
        [
            ("controller.surplus_reserve_w", c.surplus_reserve_w),
            ("controller.surplus_hysteresis_w", c.surplus_hysteresis_w),
            ("controller.max_import_w", c.max_import_w),
            ("controller.import_hysteresis_w", c.import_hysteresis_w),
        ]
        .into_iter()
        .filter(|(_, value)| !value.is_finite() || *value < 0.0)
        .map(|(field, value)| format!("{} = {} is not a non-negative number, using 0", field, value))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.device.port, 502);
        assert_eq!(config.device.unit_id, 1);
        assert_eq!(config.device.timeout_ms, 1000);
        assert_eq!(config.device.reconnect_interval_ms, 2000);
        assert_eq!(config.device.queue_delay_ms, 1);
        assert_eq!(config.controller.mode, ControllerMode::Both);
        assert!(config.controller.force_off_on_cutoff);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        // Host is required
        assert!(config.validate().is_err());

        config.device.host = "192.168.1.50".to_string();
        assert!(config.validate().is_ok());

        config.device.port = 0;
        assert!(config.validate().is_err());

        // A bad tunable is clamped, it never disables the device
        config.device.port = 502;
        config.controller.max_import_w = -1.0;
        assert!(config.validate().is_ok());
        let warnings = config.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("controller.max_import_w"));
    }

    #[test]
    fn test_poll_intervals_are_clamped() {
        let mut telemetry = TelemetryConfig {
            poll_interval_ms: 100,
            ..Default::default()
        };
        assert_eq!(telemetry.poll_interval(), Duration::from_millis(500));

        telemetry.poll_interval_ms = 60_000;
        telemetry.compatibility = TelemetryCompatibility::KnxLoadControlPin;
        assert_eq!(telemetry.poll_interval(), Duration::from_millis(10_000));

        let controller = ControllerConfig {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(controller.poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_yaml_load_list_and_enums() {
        let yaml = r#"
device:
  host: meter.local
  base_address: one
  word_order: loHi
telemetry:
  compatibility: knxLoadControlPin
controller:
  mode: surplus
  loads:
    - name: boiler
      powerW: 1200
      priority: 10
      minOnSec: 60
    - name: heat-pump
      powerW: 2000
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.device.base_address, AddressBase::One);
        assert_eq!(config.device.word_order, WordOrder::LoHi);
        assert_eq!(
            config.telemetry.compatibility,
            TelemetryCompatibility::KnxLoadControlPin
        );
        assert_eq!(config.controller.mode, ControllerMode::Surplus);

        let loads = config.controller.load_definitions();
        assert_eq!(loads.len(), 2);
        assert_eq!(loads[0].name, "boiler");
        assert_eq!(loads[0].min_on_seconds, 60);
        assert_eq!(loads[1].priority, 100.0);
    }

    #[test]
    fn test_config_serialization() {
        let mut config = Config::default();
        config.device.host = "10.0.0.7".to_string();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let deserialized: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(deserialized.device.host, "10.0.0.7");
        assert_eq!(deserialized.device.port, config.device.port);
    }
}
