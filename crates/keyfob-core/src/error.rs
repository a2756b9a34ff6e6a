//! Error types for keyfob-core.
//!
//! Every variant is recoverable: the connection supervisor funnels link
//! failures into `Disconnected` and retries, and the command dispatcher
//! moves on to the next queued command after a failed write.
//!
//! ## Recovery by kind
//!
//! | Kind | Raised by | Recovery |
//! |------|-----------|----------|
//! | [`FailureKind::Scan`] | adapter refused or aborted a scan | retry after the scan backoff (30 s) |
//! | [`FailureKind::Connect`] | link request failed | `Disconnected`, reconnect after 5 s |
//! | [`FailureKind::Bond`] | pairing rejected or unavailable | `Disconnected`, reconnect after 5 s |
//! | [`FailureKind::ServiceDiscovery`] | lock service or characteristic missing | `Disconnected`, reconnect after 5 s |
//! | [`FailureKind::Timeout`] | connect guard expired | link torn down, reconnect after 5 s |
//! | [`FailureKind::Write`] | command write failed | logged, next command proceeds |
//! | [`FailureKind::RssiRead`] | signal strength unavailable | sample skipped |

use std::time::Duration;

use keyfob_types::{Command, ParseError};
use thiserror::Error;

/// Errors that can occur while driving the lock peripheral.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy stack error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Scanning could not be started or was aborted by the platform.
    #[error("Scan failed: {0}")]
    ScanFailed(String),

    /// Connection failed with a specific reason.
    #[error("Connection failed: {reason}")]
    ConnectFailed {
        /// The peripheral address, if known.
        address: Option<String>,
        /// The structured reason for the failure.
        reason: ConnectionFailureReason,
    },

    /// Pairing could not be completed.
    #[error("Bonding failed: {0}")]
    BondFailed(String),

    /// Service discovery failed or did not yield the lock service.
    #[error("Service discovery failed: {0}")]
    ServiceDiscoveryFailed(String),

    /// Required characteristic not present on the peripheral.
    #[error("Characteristic not found: {uuid} (searched in {service_count} services)")]
    CharacteristicNotFound {
        /// The UUID that was not found.
        uuid: String,
        /// Number of services that were searched.
        service_count: usize,
    },

    /// Write to the command characteristic failed.
    #[error("Write failed to characteristic {uuid}: {reason}")]
    WriteFailed {
        /// The characteristic UUID.
        uuid: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Signal strength could not be read.
    #[error("RSSI read failed: {0}")]
    RssiReadFailed(String),

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// The link is not ready to carry commands.
    #[error("Peripheral is not ready (command {0} not sent)")]
    NotReady(Command),

    /// The command queue reached its capacity.
    #[error("Command queue full ({capacity} pending), {command} rejected")]
    QueueFull {
        /// The rejected command.
        command: Command,
        /// Configured capacity.
        capacity: usize,
    },

    /// Operation was cancelled (controller shut down).
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed identity or command text.
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Structured reasons for connection failures.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionFailureReason {
    /// Bluetooth adapter not available or powered off.
    AdapterUnavailable,
    /// The peripheral is not known to the adapter (never seen in a scan).
    NotFound,
    /// Device rejected the connection.
    Rejected,
    /// Generic BLE error.
    BleError(String),
    /// Other/unknown error.
    Other(String),
}

impl std::fmt::Display for ConnectionFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AdapterUnavailable => write!(f, "Bluetooth adapter unavailable"),
            Self::NotFound => write!(f, "peripheral not known to the adapter"),
            Self::Rejected => write!(f, "connection rejected by device"),
            Self::BleError(msg) => write!(f, "BLE error: {}", msg),
            Self::Other(msg) => write!(f, "{}", msg),
        }
    }
}

/// Coarse classification of failures, used for recovery decisions and
/// reported in diagnostic events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Scan could not run.
    Scan,
    /// Link could not be established.
    Connect,
    /// Pairing failed.
    Bond,
    /// Lock service could not be resolved.
    ServiceDiscovery,
    /// A command write failed.
    Write,
    /// Signal strength could not be read.
    RssiRead,
    /// A guarded operation took too long.
    Timeout,
    /// Anything else.
    Other,
}

impl Error {
    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a characteristic not found error.
    pub fn characteristic_not_found(uuid: impl Into<String>, service_count: usize) -> Self {
        Self::CharacteristicNotFound {
            uuid: uuid.into(),
            service_count,
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create a connection failure with structured reason.
    pub fn connection_failed(address: Option<String>, reason: ConnectionFailureReason) -> Self {
        Self::ConnectFailed { address, reason }
    }

    /// Classify this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::ScanFailed(_) => FailureKind::Scan,
            Error::ConnectFailed { .. } => FailureKind::Connect,
            Error::BondFailed(_) => FailureKind::Bond,
            Error::ServiceDiscoveryFailed(_) | Error::CharacteristicNotFound { .. } => {
                FailureKind::ServiceDiscovery
            }
            Error::WriteFailed { .. } => FailureKind::Write,
            Error::RssiReadFailed(_) => FailureKind::RssiRead,
            Error::Timeout { .. } => FailureKind::Timeout,
            _ => FailureKind::Other,
        }
    }
}

/// Result type alias using keyfob-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
