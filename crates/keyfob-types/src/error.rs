//! Error types for data parsing in keyfob-types.

use thiserror::Error;

/// Errors that can occur when parsing identities, commands and addresses.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in keyfob-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The text is not a six-octet Bluetooth device address.
    #[error("Invalid device address '{0}': expected six hex octets like AA:BB:CC:DD:EE:FF")]
    InvalidAddress(String),

    /// The pairing secret is empty or contains non-digit characters.
    #[error("Invalid pairing secret: {0}")]
    InvalidSecret(String),

    /// The text does not name a known command.
    #[error("Unknown command '{0}': expected one of lock, unlock, trunk, locate")]
    UnknownCommand(String),

    /// Failed to parse a UUID.
    #[error("Invalid UUID '{value}': {reason}")]
    InvalidUuid {
        /// The rejected input.
        value: String,
        /// Why the parser rejected it.
        reason: String,
    },
}

/// Result type alias using keyfob-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
