//! Configuration file management.
//!
//! The configuration lives in `<config dir>/keyfob/config.toml` and mirrors
//! the controller's tunables section by section:
//!
//! ```toml
//! [peripheral]
//! address = "5C:01:3B:96:DD:56"
//! pairing_secret = "123456"
//!
//! [proximity]
//! unlock_threshold_dbm = -88
//! lock_threshold_dbm = -93
//! near_confirmations = 3
//!
//! [connection]
//! reconnect_delay_secs = 5
//!
//! [dispatcher]
//! queue_capacity = 32
//! ```
//!
//! Every key is optional; missing keys take the defaults of the deployed
//! peripheral.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use keyfob_core::{
    ControllerConfig, DispatcherConfig, MAX_TIMER_PERIOD, ProximityConfig, SupervisorConfig,
};
use keyfob_types::uuids::{
    COMMAND_WRITE, DEFAULT_ADDRESS, DEFAULT_PAIRING_SECRET, LOCK_SERVICE, STATUS_NOTIFY,
    parse_uuid,
};
use keyfob_types::{Address, PairingSecret, PeripheralIdentity};

/// Configuration file structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which peripheral to control.
    pub peripheral: PeripheralConfig,
    /// Proximity estimation.
    pub proximity: ProximitySection,
    /// Connection lifecycle timing.
    pub connection: ConnectionSection,
    /// Command queue.
    pub dispatcher: DispatcherSection,
}

impl Config {
    /// Load configuration from the default path, or defaults if there is no file.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Load configuration from `path` if given, otherwise from the default path.
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Self::load_default(),
        }
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        // Create parent directories if needed
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return any errors.
    ///
    /// This checks:
    /// - The address, UUIDs and pairing secret parse
    /// - The median window is odd and the unlock threshold lies above the
    ///   lock threshold
    /// - Confirmation counts and all durations are non-zero, and timer
    ///   periods stay within a day
    ///
    /// # Example
    ///
    /// ```
    /// use keyfob_cli::config::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        errors.extend(self.peripheral.validate());
        errors.extend(self.proximity.validate());
        errors.extend(self.connection.validate());
        errors.extend(self.dispatcher.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration.
    pub fn load_validated(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = Self::load_from(path)?;
        config.validate()?;
        Ok(config)
    }

    /// The peripheral to control.
    pub fn identity(&self) -> Result<PeripheralIdentity, ConfigError> {
        self.validate()?;
        self.peripheral.identity().map_err(ConfigError::Validation)
    }

    /// The controller settings.
    pub fn controller_config(&self) -> Result<ControllerConfig, ConfigError> {
        self.validate()?;
        Ok(ControllerConfig {
            supervisor: self.connection.to_core(),
            proximity: self.proximity.to_core(),
            dispatcher: self.dispatcher.to_core(),
            auto_mode: self.proximity.auto_mode,
            ..Default::default()
        })
    }
}

/// `[peripheral]`: identity of the lock peripheral.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeripheralConfig {
    /// Bluetooth address, e.g. `5C:01:3B:96:DD:56`.
    pub address: String,
    /// GATT service UUID.
    pub service: String,
    /// Characteristic commands are written to.
    pub write_characteristic: String,
    /// Characteristic status notifications arrive on.
    pub notify_characteristic: String,
    /// Numeric pairing PIN.
    pub pairing_secret: String,
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            service: LOCK_SERVICE.to_string(),
            write_characteristic: COMMAND_WRITE.to_string(),
            notify_characteristic: STATUS_NOTIFY.to_string(),
            pairing_secret: DEFAULT_PAIRING_SECRET.to_string(),
        }
    }
}

impl PeripheralConfig {
    /// Validate peripheral configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        match self.identity() {
            Ok(_) => Vec::new(),
            Err(errors) => errors,
        }
    }

    fn identity(&self) -> Result<PeripheralIdentity, Vec<ValidationError>> {
        let mut errors = Vec::new();
        let mut field = |name: &str, message: String| {
            errors.push(ValidationError {
                field: format!("peripheral.{name}"),
                message,
            });
        };

        let address = self
            .address
            .parse::<Address>()
            .map_err(|e| field("address", e.to_string()))
            .ok();
        let service = parse_uuid(&self.service)
            .map_err(|e| field("service", e.to_string()))
            .ok();
        let write = parse_uuid(&self.write_characteristic)
            .map_err(|e| field("write_characteristic", e.to_string()))
            .ok();
        let notify = parse_uuid(&self.notify_characteristic)
            .map_err(|e| field("notify_characteristic", e.to_string()))
            .ok();
        let secret = PairingSecret::new(self.pairing_secret.clone())
            .map_err(|e| field("pairing_secret", e.to_string()))
            .ok();

        match (address, service, write, notify, secret) {
            (Some(address), Some(service), Some(write), Some(notify), Some(secret)) => {
                Ok(PeripheralIdentity::new(address)
                    .with_service(service)
                    .with_write_characteristic(write)
                    .with_notify_characteristic(notify)
                    .with_secret(secret))
            }
            _ => Err(errors),
        }
    }
}

/// `[proximity]`: RSSI smoothing and thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProximitySection {
    /// Whether proximity locks and unlocks at startup.
    pub auto_mode: bool,
    /// Median window size. Must be odd.
    pub window: usize,
    /// Smoothed RSSI above this is near.
    pub unlock_threshold_dbm: i16,
    /// Smoothed RSSI below this is far.
    pub lock_threshold_dbm: i16,
    /// Minimum time between decisions in milliseconds.
    pub debounce_ms: u64,
    /// Consecutive near samples required to unlock.
    pub near_confirmations: u32,
    /// Consecutive far samples required to lock.
    pub far_confirmations: u32,
    /// RSSI sampling period in milliseconds.
    pub sample_interval_ms: u64,
}

impl Default for ProximitySection {
    fn default() -> Self {
        Self::from_core(&ProximityConfig::default(), true)
    }
}

impl ProximitySection {
    fn from_core(config: &ProximityConfig, auto_mode: bool) -> Self {
        Self {
            auto_mode,
            window: config.window,
            unlock_threshold_dbm: config.unlock_threshold_dbm,
            lock_threshold_dbm: config.lock_threshold_dbm,
            debounce_ms: config.debounce.as_millis() as u64,
            near_confirmations: config.near_confirmations,
            far_confirmations: config.far_confirmations,
            sample_interval_ms: config.sample_interval.as_millis() as u64,
        }
    }

    fn to_core(&self) -> ProximityConfig {
        ProximityConfig {
            window: self.window,
            unlock_threshold_dbm: self.unlock_threshold_dbm,
            lock_threshold_dbm: self.lock_threshold_dbm,
            debounce: Duration::from_millis(self.debounce_ms),
            near_confirmations: self.near_confirmations,
            far_confirmations: self.far_confirmations,
            sample_interval: Duration::from_millis(self.sample_interval_ms),
        }
    }

    /// Validate proximity configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.window.is_multiple_of(2) {
            errors.push(ValidationError {
                field: "proximity.window".to_string(),
                message: format!("window {} must be odd", self.window),
            });
        }
        if self.unlock_threshold_dbm <= self.lock_threshold_dbm {
            errors.push(ValidationError {
                field: "proximity.unlock_threshold_dbm".to_string(),
                message: format!(
                    "unlock threshold {} dBm must be above lock threshold {} dBm",
                    self.unlock_threshold_dbm, self.lock_threshold_dbm
                ),
            });
        }
        for (name, value) in [
            ("near_confirmations", self.near_confirmations),
            ("far_confirmations", self.far_confirmations),
        ] {
            if value == 0 {
                errors.push(ValidationError {
                    field: format!("proximity.{name}"),
                    message: "must be at least 1".to_string(),
                });
            }
        }
        if self.sample_interval_ms == 0 {
            errors.push(ValidationError {
                field: "proximity.sample_interval_ms".to_string(),
                message: "sample interval must be > 0".to_string(),
            });
        } else if Duration::from_millis(self.sample_interval_ms) > MAX_TIMER_PERIOD {
            errors.push(ValidationError {
                field: "proximity.sample_interval_ms".to_string(),
                message: format!(
                    "sample interval must be at most {} ms",
                    MAX_TIMER_PERIOD.as_millis()
                ),
            });
        }

        errors
    }
}

/// `[connection]`: supervisor timing, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    pub connect_timeout_secs: u64,
    pub reconnect_delay_secs: u64,
    pub scan_retry_delay_secs: u64,
    pub supervisor_tick_secs: u64,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        let core = SupervisorConfig::default();
        Self {
            connect_timeout_secs: core.connect_timeout.as_secs(),
            reconnect_delay_secs: core.reconnect_delay.as_secs(),
            scan_retry_delay_secs: core.scan_retry_delay.as_secs(),
            supervisor_tick_secs: core.supervisor_tick.as_secs(),
        }
    }
}

impl ConnectionSection {
    fn to_core(&self) -> SupervisorConfig {
        SupervisorConfig::default()
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .reconnect_delay(Duration::from_secs(self.reconnect_delay_secs))
            .scan_retry_delay(Duration::from_secs(self.scan_retry_delay_secs))
            .supervisor_tick(Duration::from_secs(self.supervisor_tick_secs))
    }

    /// Validate connection configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        [
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("reconnect_delay_secs", self.reconnect_delay_secs),
            ("scan_retry_delay_secs", self.scan_retry_delay_secs),
            ("supervisor_tick_secs", self.supervisor_tick_secs),
        ]
        .into_iter()
        .filter_map(|(name, value)| {
            let message = if value == 0 {
                "must be > 0".to_string()
            } else if value > MAX_TIMER_PERIOD.as_secs() {
                format!("must be at most {}", MAX_TIMER_PERIOD.as_secs())
            } else {
                return None;
            };
            Some(ValidationError {
                field: format!("connection.{name}"),
                message,
            })
        })
        .collect()
    }
}

/// `[dispatcher]`: command queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSection {
    /// Maximum queued commands; 0 means unbounded.
    pub queue_capacity: usize,
    /// Per-write timeout in seconds.
    pub write_timeout_secs: u64,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        let core = DispatcherConfig::default();
        Self {
            queue_capacity: core.capacity.unwrap_or(0),
            write_timeout_secs: core.write_timeout.as_secs(),
        }
    }
}

impl DispatcherSection {
    fn to_core(&self) -> DispatcherConfig {
        DispatcherConfig {
            capacity: (self.queue_capacity > 0).then_some(self.queue_capacity),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
        }
    }

    /// Validate dispatcher configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.write_timeout_secs == 0 {
            errors.push(ValidationError {
                field: "dispatcher.write_timeout_secs".to_string(),
                message: "write timeout must be > 0".to_string(),
            });
        }
        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The field path (e.g., `proximity.window`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("keyfob")
        .join("config.toml")
}
