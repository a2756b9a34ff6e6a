//! Utility functions for keyfob-core.

use btleplug::api::BDAddr;
use btleplug::platform::PeripheralId;

use keyfob_types::Address;

/// Format a peripheral ID as a string.
///
/// On macOS, peripheral IDs are UUIDs. On other platforms, they may be
/// MAC addresses or other formats. This function extracts the useful
/// identifier string.
pub fn format_peripheral_id(id: &PeripheralId) -> String {
    format!("{:?}", id)
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// Create an identifier string from an address and peripheral ID.
///
/// On macOS where addresses are 00:00:00:00:00:00, uses the peripheral ID.
/// On other platforms, uses the Bluetooth address.
pub fn create_identifier(address: &str, peripheral_id: &PeripheralId) -> String {
    if is_unknown_address(address) {
        format_peripheral_id(peripheral_id)
    } else {
        address.to_string()
    }
}

/// Whether the platform withheld the real address.
pub fn is_unknown_address(address: &str) -> bool {
    address == "00:00:00:00:00:00"
}

/// Convert to btleplug's address type.
pub fn to_bdaddr(address: Address) -> BDAddr {
    BDAddr::from(address.octets())
}
