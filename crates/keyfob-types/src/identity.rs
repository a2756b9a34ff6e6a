//! Static identity of the target peripheral.
//!
//! A [`PeripheralIdentity`] names the one device the controller talks to:
//! its Bluetooth address, the GATT service and characteristics used for
//! commands and status, and the PIN presented during bonding. It is built
//! once at startup and never mutated afterwards.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::{ParseError, ParseResult};
use crate::uuid::{
    COMMAND_WRITE, DEFAULT_ADDRESS, DEFAULT_PAIRING_SECRET, LOCK_SERVICE, STATUS_NOTIFY,
};

/// A six-octet Bluetooth device address.
///
/// Parsing accepts `:` or `-` separators in either case; display is always
/// upper-case and colon separated, which is also what address matching
/// compares against.
///
/// ```
/// use keyfob_types::Address;
///
/// let addr: Address = "5c-01-3b-96-dd-56".parse().unwrap();
/// assert_eq!(addr.to_string(), "5C:01:3B:96:DD:56");
/// assert!(addr.matches("5C:01:3B:96:DD:56"));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address([u8; 6]);

impl Address {
    /// Create an address from raw octets (most significant first).
    #[must_use]
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// The raw octets, most significant first.
    #[must_use]
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Whether `other` denotes this address. Unparseable text never matches.
    #[must_use]
    pub fn matches(&self, other: &str) -> bool {
        other.parse::<Address>().is_ok_and(|a| a == *self)
    }
}

impl FromStr for Address {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parts: Vec<&str> = trimmed.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(ParseError::InvalidAddress(s.to_string()));
        }

        let mut octets = [0u8; 6];
        for (slot, part) in octets.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(ParseError::InvalidAddress(s.to_string()));
            }
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| ParseError::InvalidAddress(s.to_string()))?;
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

#[cfg(feature = "serde")]
impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Numeric PIN presented to the peripheral while bonding.
///
/// The `Debug` implementation redacts the digits so the secret does not
/// end up in logs.
#[derive(Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
pub struct PairingSecret(String);

impl PairingSecret {
    /// Validate and wrap a PIN. Only ASCII digits are accepted.
    pub fn new(pin: impl Into<String>) -> ParseResult<Self> {
        let pin = pin.into();
        if pin.is_empty() {
            return Err(ParseError::InvalidSecret("PIN cannot be empty".to_string()));
        }
        if !pin.chars().all(|c| c.is_ascii_digit()) {
            return Err(ParseError::InvalidSecret(
                "PIN must contain only digits".to_string(),
            ));
        }
        Ok(Self(pin))
    }

    /// The PIN as text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The PIN as a BLE passkey, if it fits in the six-digit passkey range.
    #[must_use]
    pub fn as_passkey(&self) -> Option<u32> {
        self.0.parse::<u32>().ok().filter(|p| *p <= 999_999)
    }
}

impl fmt::Debug for PairingSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PairingSecret(******)")
    }
}

impl TryFrom<String> for PairingSecret {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PairingSecret> for String {
    fn from(value: PairingSecret) -> Self {
        value.0
    }
}

/// Identity of the one peripheral this controller drives.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PeripheralIdentity {
    address: Address,
    service: Uuid,
    write_characteristic: Uuid,
    notify_characteristic: Uuid,
    secret: PairingSecret,
}

impl Default for PeripheralIdentity {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS
                .parse()
                .unwrap_or(Address::new([0x5C, 0x01, 0x3B, 0x96, 0xDD, 0x56])),
            service: LOCK_SERVICE,
            write_characteristic: COMMAND_WRITE,
            notify_characteristic: STATUS_NOTIFY,
            secret: PairingSecret(DEFAULT_PAIRING_SECRET.to_string()),
        }
    }
}

impl PeripheralIdentity {
    /// Identity of the deployed peripheral with its default UUIDs and PIN.
    pub fn new(address: Address) -> Self {
        Self {
            address,
            ..Default::default()
        }
    }

    /// Use a different GATT service.
    #[must_use]
    pub fn with_service(mut self, service: Uuid) -> Self {
        self.service = service;
        self
    }

    /// Use a different command characteristic.
    #[must_use]
    pub fn with_write_characteristic(mut self, uuid: Uuid) -> Self {
        self.write_characteristic = uuid;
        self
    }

    /// Use a different status characteristic.
    #[must_use]
    pub fn with_notify_characteristic(mut self, uuid: Uuid) -> Self {
        self.notify_characteristic = uuid;
        self
    }

    /// Use a different pairing PIN.
    #[must_use]
    pub fn with_secret(mut self, secret: PairingSecret) -> Self {
        self.secret = secret;
        self
    }

    /// Peripheral address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Service holding both characteristics.
    pub fn service(&self) -> Uuid {
        self.service
    }

    /// Characteristic commands are written to.
    pub fn write_characteristic(&self) -> Uuid {
        self.write_characteristic
    }

    /// Characteristic status notifications arrive on.
    pub fn notify_characteristic(&self) -> Uuid {
        self.notify_characteristic
    }

    /// Bonding PIN.
    pub fn secret(&self) -> &PairingSecret {
        &self.secret
    }

    /// Whether a discovered device address belongs to this peripheral.
    pub fn matches_address(&self, address: &str) -> bool {
        self.address.matches(address)
    }
}
