//! Core types for the lock peripheral's state and wire vocabulary.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Lifecycle of the link to the peripheral.
///
/// The supervisor walks `Idle → Scanning → Connecting → (Bonding →)?
/// DiscoveringServices → Ready` and falls back to `Disconnected` on any
/// failure. There is no terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ConnectionState {
    /// Supervisor not started, or torn down.
    #[default]
    Idle,
    /// Looking for the peripheral's advertisements.
    Scanning,
    /// Link requested, waiting for it to come up.
    Connecting,
    /// Link up, pairing in progress.
    Bonding,
    /// Resolving the lock service and its characteristics.
    DiscoveringServices,
    /// Characteristics resolved and notifications enabled.
    Ready,
    /// Link lost or failed; a retry is pending.
    Disconnected,
}

impl ConnectionState {
    /// Whether commands may be written in this state.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }

    /// Whether a link attempt is in flight (scan, connect, bond or discovery).
    #[must_use]
    pub fn is_establishing(&self) -> bool {
        matches!(
            self,
            ConnectionState::Scanning
                | ConnectionState::Connecting
                | ConnectionState::Bonding
                | ConnectionState::DiscoveringServices
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Scanning => "Scanning",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Bonding => "Bonding",
            ConnectionState::DiscoveringServices => "Discovering services",
            ConnectionState::Ready => "Connected",
            ConnectionState::Disconnected => "Disconnected",
        };
        f.write_str(label)
    }
}

/// Believed state of the vehicle lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum LockState {
    /// No authoritative information (startup or after a disconnect).
    #[default]
    Unknown,
    /// Locked.
    Locked,
    /// Unlocked.
    Unlocked,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockState::Unknown => write!(f, "Unknown"),
            LockState::Locked => write!(f, "Locked"),
            LockState::Unlocked => write!(f, "Unlocked"),
        }
    }
}

/// Pairing state of the peripheral as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum BondState {
    /// Not paired.
    Unbonded,
    /// Pairing in progress.
    Bonding,
    /// Paired; a long-term key exists.
    Bonded,
}

/// An actuation request for the peripheral.
///
/// Each command maps to one fixed upper-case ASCII payload. Parsing from
/// text is case-insensitive and also accepts the older spellings the
/// firmware used to receive.
///
/// ```
/// use keyfob_types::Command;
///
/// assert_eq!(Command::Unlock.payload(), "UNLOCK");
/// assert_eq!("Trunk Release".parse::<Command>(), Ok(Command::Trunk));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Command {
    /// Lock the doors.
    Lock,
    /// Unlock the doors.
    Unlock,
    /// Release the trunk.
    Trunk,
    /// Flash/beep so the vehicle can be found.
    Locate,
}

impl Command {
    /// All commands, in a stable order.
    pub const ALL: [Command; 4] = [Command::Lock, Command::Unlock, Command::Trunk, Command::Locate];

    /// ASCII payload written to the command characteristic.
    #[must_use]
    pub fn payload(&self) -> &'static str {
        match self {
            Command::Lock => "LOCK",
            Command::Unlock => "UNLOCK",
            Command::Trunk => "TRUNK",
            Command::Locate => "LOCATE",
        }
    }

    /// Payload as bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &'static [u8] {
        self.payload().as_bytes()
    }

    /// The lock state this command asks for, if it is a lock/unlock command.
    #[must_use]
    pub fn target_state(&self) -> Option<LockState> {
        match self {
            Command::Lock => Some(LockState::Locked),
            Command::Unlock => Some(LockState::Unlocked),
            Command::Trunk | Command::Locate => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.payload())
    }
}

impl FromStr for Command {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lock" => Ok(Command::Lock),
            "unlock" => Ok(Command::Unlock),
            "trunk" | "trunk release" => Ok(Command::Trunk),
            "locate" | "locate me" => Ok(Command::Locate),
            _ => Err(ParseError::UnknownCommand(s.to_string())),
        }
    }
}

/// Status text pushed by the peripheral on the notify characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", content = "text", rename_all = "snake_case"))]
pub enum Notification {
    /// Doors reported locked.
    Locked,
    /// Doors reported unlocked.
    Unlocked,
    /// Locate beacon acknowledged.
    Located,
    /// Trunk release acknowledged.
    TrunkReleased,
    /// Text the controller does not interpret.
    Other(String),
}

impl Notification {
    /// Interpret a raw notification payload.
    ///
    /// Matching is a case-insensitive substring search. `unlocked` is
    /// checked before `locked` because the former contains the latter.
    ///
    /// ```
    /// use keyfob_types::Notification;
    ///
    /// assert_eq!(Notification::parse(b"Unlocked"), Notification::Unlocked);
    /// assert_eq!(Notification::parse(b"door LOCKED\0"), Notification::Locked);
    /// assert_eq!(Notification::parse(b"Trunk Released"), Notification::TrunkReleased);
    /// ```
    #[must_use]
    pub fn parse(payload: &[u8]) -> Self {
        let text = Self::decode(payload);
        let lower = text.to_lowercase();

        if lower.contains("unlocked") {
            Notification::Unlocked
        } else if lower.contains("locked") {
            Notification::Locked
        } else if lower.contains("located") {
            Notification::Located
        } else if lower.contains("trunk") {
            Notification::TrunkReleased
        } else {
            Notification::Other(text)
        }
    }

    /// Decode a payload as text, dropping trailing NULs and surrounding whitespace.
    #[must_use]
    pub fn decode(payload: &[u8]) -> String {
        String::from_utf8_lossy(payload)
            .trim_end_matches('\0')
            .trim()
            .to_string()
    }

    /// The lock state this notification asserts, if any.
    #[must_use]
    pub fn lock_state(&self) -> Option<LockState> {
        match self {
            Notification::Locked => Some(LockState::Locked),
            Notification::Unlocked => Some(LockState::Unlocked),
            _ => None,
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::Locked => write!(f, "Locked"),
            Notification::Unlocked => write!(f, "Unlocked"),
            Notification::Located => write!(f, "Located"),
            Notification::TrunkReleased => write!(f, "Trunk Released"),
            Notification::Other(text) => write!(f, "{}", text),
        }
    }
}

/// Debounced distance-band transition produced from signal strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ProximityEvent {
    /// The key holder came within unlocking range.
    Near,
    /// The key holder left locking range.
    Far,
}

impl fmt::Display for ProximityEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProximityEvent::Near => write!(f, "near"),
            ProximityEvent::Far => write!(f, "far"),
        }
    }
}
