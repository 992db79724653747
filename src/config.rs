//! Configuration management for the gateway daemon
//!
//! Loads, validates, and holds the immutable configuration described in
//! the data model: Modbus connection, register map, operational defaults,
//! control tolerances, the charging schedule, and logging. Validation
//! failures never abort boot: they are logged and the built-in defaults
//! for the offending section are kept instead.

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_true() -> bool {
    true
}

/// Root configuration document, immutable once the daemon has booted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Modbus TCP connection parameters
    pub modbus: ModbusConfig,

    /// Device instance used to name the published object tree
    pub device_instance: u32,

    /// Require the host-bus publisher to be available; fail fast on startup if unavailable
    #[serde(default = "default_true")]
    pub require_bus: bool,

    /// Register address mappings
    pub registers: RegistersConfig,

    /// Default operational values used until the device has been queried
    pub defaults: DefaultsConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Charging schedule configuration
    pub schedule: ScheduleConfig,

    /// Control and safety-limit configuration
    pub controls: ControlsConfig,

    /// Dynamic-price provider configuration; the provider itself is an
    /// external collaborator, this only shapes how its cache behaves.
    pub price: PriceConfig,

    /// Polling interval in milliseconds
    pub poll_interval_ms: u64,

    /// Timezone used to evaluate schedule membership
    pub timezone: String,
}

/// Modbus TCP connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusConfig {
    /// IP address of the EV charger
    pub ip: String,

    /// TCP port (typically 502)
    pub port: u16,

    /// Unit-id for telemetry and set-point registers
    pub socket_unit_id: u8,

    /// Unit-id for station-level limits and information registers
    pub station_unit_id: u8,
}

/// Register address mappings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistersConfig {
    /// Voltage register base address (3x f32 BE, L1/L2/L3)
    pub voltages: u16,

    /// Current register base address (3x f32 BE, L1/L2/L3)
    pub currents: u16,

    /// Power register base address (4x f32 BE: L1, L2, L3, total — the
    /// only layout that fits 8 registers; see DESIGN.md for the open
    /// question this resolves)
    pub power: u16,

    /// Energy counter register base address (f64 BE, Wh)
    pub energy: u16,

    /// Socket-state ASCII register base address (5 registers)
    pub socket_state: u16,

    /// Set-point register base address (2 registers, f32 BE, writable)
    pub set_point: u16,

    /// Active-phase-count register address (u16)
    pub phases: u16,

    /// Firmware version string register base address and length
    pub firmware_version: u16,
    pub firmware_version_count: u16,

    /// Serial number string register base address and length
    pub station_serial: u16,
    pub station_serial_count: u16,

    /// Manufacturer string register base address and length
    pub manufacturer: u16,
    pub manufacturer_count: u16,

    /// Station max current register base address (2 registers, f32 BE)
    pub station_max_current: u16,
}

/// Default operational values used as fallbacks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Default intended current in amperes until the operator sets one
    pub intended_set_current: f32,

    /// Fallback station max current if the register read fails at boot
    pub station_max_current: f32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (DEBUG, INFO, WARNING, ERROR, CRITICAL)
    pub level: String,

    /// Path to log file
    pub file: String,

    /// Whether to use JSON-structured log format
    pub json_format: bool,

    /// Whether to also log to the console
    pub console_output: bool,

    /// Max log file size in MB before rotation
    pub max_file_size_mb: u32,

    /// Number of rotated backup files to keep
    pub backup_count: u32,
}

/// A single schedule window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleItem {
    /// Whether this window is active
    pub enabled: bool,

    /// Day bitmask, bit 0 = Sunday .. bit 6 = Saturday
    pub days_mask: u8,

    /// Local start time, "HH:MM"
    pub start: String,

    /// Local end time, "HH:MM"; wraps midnight when `end <= start`
    pub end: String,
}

/// Schedule configuration container
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScheduleConfig {
    pub items: Vec<ScheduleItem>,
}

/// Control and safety-limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlsConfig {
    /// Tolerance for set-point read-back verification, in amperes
    pub current_tolerance: f32,

    /// Minimum change in amperes that triggers a rewrite outside the watchdog
    pub update_difference_threshold: f32,

    /// Delay before verifying a write via read-back, in seconds
    pub verification_delay_secs: f64,

    /// Delay between retry attempts, in seconds
    pub retry_delay_secs: f64,

    /// Max retry attempts for a single Modbus operation
    pub max_retries: u32,

    /// Watchdog refresh interval, in seconds
    pub watchdog_interval_secs: u64,

    /// Hard ceiling on any set-point this daemon will write, in amperes
    pub max_set_current: f32,

    /// Minimum time a forced 6A minimum-charge floor is held, in seconds
    pub min_charge_duration_secs: u64,
}

/// Dynamic-price provider cache configuration. The provider itself lives
/// outside the core; this only controls the TTL of the cache the policy
/// engine reads synchronously.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceConfig {
    /// Whether a price provider is configured at all. When false, the
    /// policy engine never gates on price.
    pub enabled: bool,

    /// How long a cached price decision remains valid before refresh, in seconds
    pub cache_ttl_secs: u64,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            ip: "192.168.1.100".to_string(),
            port: 502,
            socket_unit_id: 1,
            station_unit_id: 200,
        }
    }
}

impl Default for RegistersConfig {
    fn default() -> Self {
        Self {
            voltages: 306,
            currents: 320,
            power: 344,
            energy: 374,
            socket_state: 1201,
            set_point: 1210,
            phases: 1215,
            firmware_version: 123,
            firmware_version_count: 17,
            station_serial: 157,
            station_serial_count: 11,
            manufacturer: 117,
            manufacturer_count: 5,
            station_max_current: 1100,
        }
    }
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            intended_set_current: 6.0,
            station_max_current: 32.0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            file: "/var/log/evgate.log".to_string(),
            json_format: false,
            console_output: true,
            max_file_size_mb: 10,
            backup_count: 5,
        }
    }
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            current_tolerance: 0.5,
            update_difference_threshold: 0.1,
            verification_delay_secs: 0.1,
            retry_delay_secs: 0.5,
            max_retries: 3,
            watchdog_interval_secs: 30,
            max_set_current: 64.0,
            min_charge_duration_secs: 300,
        }
    }
}

impl Default for PriceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cache_ttl_secs: 900,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            modbus: ModbusConfig::default(),
            device_instance: 0,
            require_bus: true,
            registers: RegistersConfig::default(),
            defaults: DefaultsConfig::default(),
            logging: LoggingConfig::default(),
            schedule: ScheduleConfig::default(),
            controls: ControlsConfig::default(),
            price: PriceConfig::default(),
            poll_interval_ms: 1000,
            timezone: "UTC".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the first default path found, falling back
    /// to built-in defaults (with a warning) when none exists or parsing fails.
    pub fn load() -> Self {
        Self::load_with_override(None)
    }

    /// Load configuration, optionally from an explicit path. A missing or
    /// invalid override file still falls back to defaults: validation
    /// failures never abort boot.
    pub fn load_with_override(path_override: Option<&Path>) -> Self {
        let candidates: Vec<std::path::PathBuf> = match path_override {
            Some(p) => vec![p.to_path_buf()],
            None => vec![
                "evgate_config.yaml".into(),
                "/data/evgate_config.yaml".into(),
                "/etc/evgate/config.yaml".into(),
            ],
        };

        for path in candidates {
            if !path.exists() {
                continue;
            }
            match Self::from_file(&path) {
                Ok(config) => match config.validate() {
                    Ok(()) => return config,
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "configuration failed validation, falling back to defaults"
                        );
                        return Config::default();
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "failed to parse configuration file, falling back to defaults"
                    );
                    return Config::default();
                }
            }
        }

        Config::default()
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.modbus.ip.is_empty() {
            return Err(GatewayError::validation(
                "modbus.ip",
                "IP address cannot be empty",
            ));
        }

        if self.modbus.port == 0 {
            return Err(GatewayError::validation(
                "modbus.port",
                "port must be greater than 0",
            ));
        }

        if self.defaults.intended_set_current < 0.0 {
            return Err(GatewayError::validation(
                "defaults.intended_set_current",
                "must not be negative",
            ));
        }

        if self.defaults.station_max_current <= 0.0 {
            return Err(GatewayError::validation(
                "defaults.station_max_current",
                "must be positive",
            ));
        }

        if self.poll_interval_ms == 0 {
            return Err(GatewayError::validation(
                "poll_interval_ms",
                "must be greater than 0",
            ));
        }

        for (i, item) in self.schedule.items.iter().enumerate() {
            if parse_hhmm(&item.start).is_none() {
                return Err(GatewayError::validation(
                    format!("schedule.items[{i}].start"),
                    "must be HH:MM".to_string(),
                ));
            }
            if parse_hhmm(&item.end).is_none() {
                return Err(GatewayError::validation(
                    format!("schedule.items[{i}].end"),
                    "must be HH:MM".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Parse "HH:MM" into minutes-past-midnight, or `None` if malformed.
pub fn parse_hhmm(s: &str) -> Option<u32> {
    let (h, m) = s.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}
