//! Mock link implementation for testing.
//!
//! [`MockLink`] implements [`PeripheralLink`] without any radio. Every call
//! is recorded, and individual operations can be made to fail or to take
//! time.
//!
//! A mock created with [`MockLink::new`] is *passive*: it never produces
//! link events, so tests inject them by hand. A mock created with
//! [`MockLink::responsive`] behaves like a cooperative peripheral and
//! answers connect, bond, discovery and disconnect requests with the
//! matching [`LinkEvent`] on the controller's input channel.
//!
//! # Features
//!
//! - **Call recording**: inspect what the controller asked the link to do
//! - **Failure injection**: fail scans, connects, subscriptions, RSSI reads or
//!   writes of particular commands
//! - **Latency simulation**: delay writes to exercise serialization
//! - **Scripted RSSI**: queue readings returned by successive reads

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use keyfob_types::uuids::{COMMAND_WRITE, LOCK_SERVICE, STATUS_NOTIFY};
use keyfob_types::{Address, BondState, Command, PairingSecret};

use crate::error::{ConnectionFailureReason, Error, Result};
use crate::messages::{Input, InputSender};
use crate::traits::{CharacteristicHandle, GattService, LinkEvent, PeripheralLink, ScanFilter};

/// A call made on the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCall {
    StartScan,
    StopScan,
    Connect(Address),
    Disconnect,
    BondState,
    Bond,
    DiscoverServices,
    Subscribe(uuid::Uuid),
    Write(Vec<u8>),
    ReadRssi,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A mock BLE link for testing.
///
/// # Example
///
/// ```
/// use keyfob_core::mock::MockLink;
/// use keyfob_core::traits::{CharacteristicHandle, PeripheralLink};
/// use keyfob_types::uuids::{COMMAND_WRITE, LOCK_SERVICE};
///
/// #[tokio::main]
/// async fn main() {
///     let link = MockLink::new();
///     let handle = CharacteristicHandle { service: LOCK_SERVICE, characteristic: COMMAND_WRITE };
///     link.write(&handle, b"LOCK").await.unwrap();
///     assert_eq!(link.written(), vec!["LOCK"]);
/// }
/// ```
pub struct MockLink {
    events: Option<InputSender>,
    calls: Mutex<Vec<LinkCall>>,
    bond_state: Mutex<BondState>,
    bond_result: Mutex<BondState>,
    services: Mutex<Vec<GattService>>,
    rssi_script: Mutex<VecDeque<i16>>,
    rssi: AtomicI16,
    fail_scan: AtomicBool,
    fail_connect: AtomicBool,
    fail_subscribe: AtomicBool,
    fail_rssi: AtomicBool,
    failing_payloads: Mutex<HashSet<Vec<u8>>>,
    /// Simulated write latency in milliseconds (0 = no delay).
    write_latency_ms: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl std::fmt::Debug for MockLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockLink")
            .field("responsive", &self.events.is_some())
            .field("calls", &lock(&self.calls).len())
            .field("bond_state", &*lock(&self.bond_state))
            .finish()
    }
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLink {
    /// Create a passive mock that never emits link events.
    pub fn new() -> Self {
        Self {
            events: None,
            calls: Mutex::new(Vec::new()),
            bond_state: Mutex::new(BondState::Unbonded),
            bond_result: Mutex::new(BondState::Bonded),
            services: Mutex::new(vec![GattService::new(
                LOCK_SERVICE,
                [COMMAND_WRITE, STATUS_NOTIFY],
            )]),
            rssi_script: Mutex::new(VecDeque::new()),
            rssi: AtomicI16::new(-60),
            fail_scan: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            fail_rssi: AtomicBool::new(false),
            failing_payloads: Mutex::new(HashSet::new()),
            write_latency_ms: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Create a mock that answers requests with link events on `events`.
    pub fn responsive(events: InputSender) -> Self {
        Self {
            events: Some(events),
            ..Self::new()
        }
    }

    // --- Configuration ---

    /// Set the bond state reported before pairing.
    pub fn set_bond_state(&self, state: BondState) {
        *lock(&self.bond_state) = state;
    }

    /// Set the outcome a responsive mock reports for pairing.
    pub fn set_bond_result(&self, state: BondState) {
        *lock(&self.bond_result) = state;
    }

    /// Replace the services a responsive mock reports on discovery.
    pub fn set_services(&self, services: Vec<GattService>) {
        *lock(&self.services) = services;
    }

    /// Set the RSSI returned when no scripted readings remain.
    pub fn set_rssi(&self, rssi: i16) {
        self.rssi.store(rssi, Ordering::Relaxed);
    }

    /// Queue readings returned by successive RSSI reads.
    pub fn push_rssi(&self, readings: impl IntoIterator<Item = i16>) {
        lock(&self.rssi_script).extend(readings);
    }

    /// Make scanning fail.
    pub fn fail_scan(&self, fail: bool) {
        self.fail_scan.store(fail, Ordering::Relaxed);
    }

    /// Make connect requests fail.
    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::Relaxed);
    }

    /// Make enabling notifications fail.
    pub fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::Relaxed);
    }

    /// Make RSSI reads fail.
    pub fn fail_rssi(&self, fail: bool) {
        self.fail_rssi.store(fail, Ordering::Relaxed);
    }

    /// Make writes of this command fail.
    pub fn fail_writes_of(&self, command: Command) {
        lock(&self.failing_payloads).insert(command.as_bytes().to_vec());
    }

    /// Delay every write by `latency`.
    pub fn set_write_latency(&self, latency: Duration) {
        self.write_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    // --- Simulation ---

    /// Emit a status notification as if the peripheral sent `text`.
    pub fn notify(&self, text: &str) {
        self.emit(LinkEvent::Notification {
            characteristic: STATUS_NOTIFY,
            value: Bytes::copy_from_slice(text.as_bytes()),
        });
    }

    /// Emit an unsolicited link drop.
    pub fn drop_link(&self, reason: &str) {
        self.emit(LinkEvent::Disconnected {
            reason: Some(reason.to_string()),
        });
    }

    /// Emit an arbitrary link event.
    pub fn emit(&self, event: LinkEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(Input::Link(event));
        }
    }

    // --- Inspection ---

    /// Every call made so far.
    pub fn calls(&self) -> Vec<LinkCall> {
        lock(&self.calls).clone()
    }

    /// Payloads written so far, as text.
    pub fn written(&self) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter_map(|call| match call {
                LinkCall::Write(payload) => Some(String::from_utf8_lossy(payload).into_owned()),
                _ => None,
            })
            .collect()
    }

    /// The highest number of writes observed in flight at once.
    pub fn max_concurrent_writes(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    fn record(&self, call: LinkCall) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl PeripheralLink for MockLink {
    async fn start_scan(&self, _filter: &ScanFilter) -> Result<()> {
        self.record(LinkCall::StartScan);
        if self.fail_scan.load(Ordering::Relaxed) {
            return Err(Error::ScanFailed("mock scan failure".to_string()));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(LinkCall::StopScan);
        Ok(())
    }

    async fn connect(&self, address: Address) -> Result<()> {
        self.record(LinkCall::Connect(address));
        if self.fail_connect.load(Ordering::Relaxed) {
            return Err(Error::connection_failed(
                Some(address.to_string()),
                ConnectionFailureReason::Rejected,
            ));
        }
        self.emit(LinkEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.record(LinkCall::Disconnect);
        self.emit(LinkEvent::Disconnected {
            reason: Some("requested".to_string()),
        });
        Ok(())
    }

    async fn bond_state(&self, _address: Address) -> Result<BondState> {
        self.record(LinkCall::BondState);
        Ok(*lock(&self.bond_state))
    }

    async fn bond(&self, _address: Address, _secret: &PairingSecret) -> Result<()> {
        self.record(LinkCall::Bond);
        let result = *lock(&self.bond_result);
        if self.events.is_some() {
            *lock(&self.bond_state) = result;
        }
        self.emit(LinkEvent::BondStateChanged(result));
        Ok(())
    }

    async fn discover_services(&self) -> Result<()> {
        self.record(LinkCall::DiscoverServices);
        let services = lock(&self.services).clone();
        self.emit(LinkEvent::ServicesDiscovered(services));
        Ok(())
    }

    async fn subscribe(&self, handle: &CharacteristicHandle) -> Result<()> {
        self.record(LinkCall::Subscribe(handle.characteristic));
        if self.fail_subscribe.load(Ordering::Relaxed) {
            return Err(Error::ServiceDiscoveryFailed(
                "mock subscribe failure".to_string(),
            ));
        }
        Ok(())
    }

    async fn write(&self, handle: &CharacteristicHandle, payload: &[u8]) -> Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.record(LinkCall::Write(payload.to_vec()));

        let latency = self.write_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if lock(&self.failing_payloads).contains(payload) {
            return Err(Error::WriteFailed {
                uuid: handle.characteristic.to_string(),
                reason: "mock write failure".to_string(),
            });
        }
        Ok(())
    }

    async fn read_rssi(&self) -> Result<i16> {
        self.record(LinkCall::ReadRssi);
        if self.fail_rssi.load(Ordering::Relaxed) {
            return Err(Error::RssiReadFailed("mock RSSI failure".to_string()));
        }
        let scripted = lock(&self.rssi_script).pop_front();
        Ok(scripted.unwrap_or_else(|| self.rssi.load(Ordering::Relaxed)))
    }
}
