//! Platform-agnostic types for the keyfob BLE vehicle lock controller.
//!
//! This crate provides the vocabulary shared by the control core and any
//! front end: who the peripheral is, what can be sent to it, what it says
//! back, and the states the controller moves through.
//!
//! # Features
//!
//! - [`PeripheralIdentity`]: address, GATT UUIDs and pairing PIN of the target
//! - [`Command`] / [`Notification`]: the outbound and inbound wire vocabulary
//! - [`ConnectionState`], [`LockState`], [`BondState`], [`ProximityEvent`]
//! - UUID constants and defaults for the deployed peripheral
//!
//! # Example
//!
//! ```
//! use keyfob_types::{Command, Notification, PeripheralIdentity};
//!
//! let identity = PeripheralIdentity::default();
//! assert!(identity.matches_address("5c:01:3b:96:dd:56"));
//! assert_eq!(Command::Lock.payload(), "LOCK");
//! assert_eq!(Notification::parse(b"Unlocked").to_string(), "Unlocked");
//! ```

pub mod error;
pub mod identity;
pub mod types;
pub mod uuid;

pub use error::{ParseError, ParseResult};
pub use identity::{Address, PairingSecret, PeripheralIdentity};
pub use types::{BondState, Command, ConnectionState, LockState, Notification, ProximityEvent};
pub use uuid as uuids;

/// Property-based tests for the parsers.
///
/// Run with:
/// ```bash
/// cargo test -p keyfob-types proptests
/// ```
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn notification_parse_never_panics(data in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = Notification::parse(&data);
        }

        #[test]
        fn address_display_parses_back(octets in any::<[u8; 6]>()) {
            let addr = Address::new(octets);
            let parsed: Address = addr.to_string().parse().unwrap();
            prop_assert_eq!(parsed, addr);
            prop_assert!(addr.matches(&addr.to_string().to_lowercase()));
        }

        #[test]
        fn payload_containing_unlocked_is_unlocked(prefix in "[a-z ]{0,8}", suffix in "[a-z ]{0,8}") {
            let text = format!("{prefix}UnLocked{suffix}");
            prop_assert_eq!(Notification::parse(text.as_bytes()), Notification::Unlocked);
        }
    }
}
