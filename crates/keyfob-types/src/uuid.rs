//! Bluetooth UUIDs and defaults for the vehicle lock peripheral.
//!
//! The peripheral exposes a single custom service with one characteristic
//! the client writes commands to and one it subscribes to for status text.

use uuid::{Uuid, uuid};

use crate::error::{ParseError, ParseResult};

// --- Lock peripheral service ---

/// Custom lock-controller service.
pub const LOCK_SERVICE: Uuid = uuid!("a1c658ed-1df2-4c5c-8477-708f714f01f7");

/// Characteristic receiving ASCII command payloads (`LOCK`, `UNLOCK`, ...).
pub const COMMAND_WRITE: Uuid = uuid!("f16c9c3c-fbcc-4a8c-b130-0e79948b8f82");

/// Characteristic notifying status text (`Locked`, `Unlocked`, ...).
pub const STATUS_NOTIFY: Uuid = uuid!("7dc6ca3d-f066-4bda-a742-4deb534b58d5");

// --- Deployed peripheral ---

/// Address of the deployed peripheral.
pub const DEFAULT_ADDRESS: &str = "5C:01:3B:96:DD:56";

/// Numeric PIN the peripheral expects during bonding.
pub const DEFAULT_PAIRING_SECRET: &str = "123456";

/// Parse a UUID from text, mapping failures into [`ParseError`].
pub fn parse_uuid(value: &str) -> ParseResult<Uuid> {
    Uuid::parse_str(value.trim()).map_err(|e| ParseError::InvalidUuid {
        value: value.to_string(),
        reason: e.to_string(),
    })
}
