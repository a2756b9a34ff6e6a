//! Trait abstraction over the BLE link to the lock peripheral.
//!
//! The supervisor and dispatcher only talk to a [`PeripheralLink`]. The
//! btleplug-backed [`crate::ble::BtleplugLink`] drives real hardware and
//! [`crate::mock::MockLink`] records calls for tests.
//!
//! Operations that complete asynchronously on the radio (connect, bond,
//! service discovery) only *initiate* the work here; completion arrives
//! later as a [`LinkEvent`] on the controller's input channel. Writes and
//! RSSI reads complete inline.

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use keyfob_types::{Address, BondState, PairingSecret};

use crate::error::{ConnectionFailureReason, Result};

/// A GATT service and the characteristics it exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristic UUIDs within the service.
    pub characteristics: Vec<Uuid>,
}

impl GattService {
    /// Create a service description.
    pub fn new(uuid: Uuid, characteristics: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            uuid,
            characteristics: characteristics.into_iter().collect(),
        }
    }
}

/// A resolved characteristic, addressed by its service and its own UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    /// Owning service.
    pub service: Uuid,
    /// Characteristic UUID.
    pub characteristic: Uuid,
}

/// Filter applied to scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanFilter {
    /// Only the peripheral with this address is of interest.
    pub address: Address,
    /// Service the peripheral advertises.
    pub service: Uuid,
}

/// Asynchronous completions and unsolicited notices from the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// An advertisement was seen.
    Discovered { address: String, rssi: Option<i16> },
    /// The platform aborted an active scan.
    ScanFailed { reason: String },
    /// A requested link came up.
    Connected,
    /// A requested link could not be established.
    ConnectFailed { reason: ConnectionFailureReason },
    /// The link dropped.
    Disconnected { reason: Option<String> },
    /// The platform reported a pairing change.
    BondStateChanged(BondState),
    /// Service discovery completed.
    ServicesDiscovered(Vec<GattService>),
    /// Service discovery failed.
    ServiceDiscoveryFailed { reason: String },
    /// A subscribed characteristic changed.
    Notification { characteristic: Uuid, value: Bytes },
    /// The adapter was switched on or off.
    AdapterPowered(bool),
}

/// Operations the controller needs from a BLE stack.
#[async_trait]
pub trait PeripheralLink: Send + Sync {
    // --- Discovery ---

    /// Start scanning. Matching advertisements arrive as [`LinkEvent::Discovered`].
    async fn start_scan(&self, filter: &ScanFilter) -> Result<()>;

    /// Stop scanning. Stopping an idle scanner is not an error.
    async fn stop_scan(&self) -> Result<()>;

    // --- Link ---

    /// Request a link. Completion arrives as [`LinkEvent::Connected`] or
    /// [`LinkEvent::ConnectFailed`].
    async fn connect(&self, address: Address) -> Result<()>;

    /// Tear the link down. Disconnecting an idle link is not an error.
    async fn disconnect(&self) -> Result<()>;

    // --- Pairing ---

    /// Current pairing state with the peripheral.
    async fn bond_state(&self, address: Address) -> Result<BondState>;

    /// Start pairing. Completion arrives as [`LinkEvent::BondStateChanged`].
    async fn bond(&self, address: Address, secret: &PairingSecret) -> Result<()>;

    // --- GATT ---

    /// Start service discovery. Completion arrives as
    /// [`LinkEvent::ServicesDiscovered`] or [`LinkEvent::ServiceDiscoveryFailed`].
    async fn discover_services(&self) -> Result<()>;

    /// Enable notifications on a characteristic. Values arrive as
    /// [`LinkEvent::Notification`].
    async fn subscribe(&self, handle: &CharacteristicHandle) -> Result<()>;

    /// Write with response. Returns once the peripheral acknowledged the write.
    async fn write(&self, handle: &CharacteristicHandle, payload: &[u8]) -> Result<()>;

    /// Read the link's current signal strength in dBm.
    async fn read_rssi(&self) -> Result<i16>;
}
