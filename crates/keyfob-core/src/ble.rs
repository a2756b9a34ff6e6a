//! btleplug-backed [`PeripheralLink`].
//!
//! Adapter events (advertisements, disconnections, power changes) are
//! pumped from btleplug's central event stream onto the controller input
//! channel. Connect, pairing and service discovery run on spawned tasks and
//! report their completion the same way.
//!
//! # Platform Differences
//!
//! - **Linux**: bond state and pairing go through BlueZ over D-Bus.
//! - **macOS / Windows**: the OS pairs on demand when an encrypted
//!   characteristic is first used, so the peripheral is reported as bonded.
//!   macOS also hides device addresses, so address matching only works on
//!   Linux and Windows.
//!
//! # Signal Strength
//!
//! btleplug has no call for reading the RSSI of a live connection, so
//! [`PeripheralLink::read_rssi`] returns the RSSI of the connected
//! peripheral's most recent advertisement. Readings older than the
//! configured maximum age are reported as stale.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter as BtScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use keyfob_types::{Address, BondState, PairingSecret};

use crate::error::{ConnectionFailureReason, Error, Result};
use crate::messages::{Input, InputSender};
use crate::traits::{CharacteristicHandle, GattService, LinkEvent, PeripheralLink, ScanFilter};
use crate::util::{create_identifier, to_bdaddr};

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    adapters.into_iter().next().ok_or(Error::ConnectFailed {
        address: None,
        reason: ConnectionFailureReason::AdapterUnavailable,
    })
}

/// Default age after which an advertised RSSI is considered stale.
pub const DEFAULT_RSSI_MAX_AGE: Duration = Duration::from_secs(2);

/// Signal strength of the connected peripheral's latest advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SignalReading {
    rssi: i16,
    at: Instant,
}

type SharedSignal = Arc<Mutex<Option<SignalReading>>>;

fn lock_signal(signal: &SharedSignal) -> MutexGuard<'_, Option<SignalReading>> {
    signal.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The reading if it is no older than `max_age` at `now`.
fn fresh_rssi(reading: Option<SignalReading>, now: Instant, max_age: Duration) -> Result<i16> {
    let reading = reading.ok_or_else(|| {
        Error::RssiReadFailed("no advertisement seen since connecting".to_string())
    })?;
    let age = now.saturating_duration_since(reading.at);
    if age > max_age {
        return Err(Error::RssiReadFailed(format!(
            "stale: last advertisement {} ms ago",
            age.as_millis()
        )));
    }
    Ok(reading.rssi)
}

/// A [`PeripheralLink`] over the host's Bluetooth adapter.
pub struct BtleplugLink {
    adapter: Adapter,
    adapter_name: String,
    inputs: InputSender,
    peripheral: RwLock<Option<Peripheral>>,
    current: Arc<RwLock<Option<PeripheralId>>>,
    signal: SharedSignal,
    rssi_max_age: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    event_pump: JoinHandle<()>,
}

impl std::fmt::Debug for BtleplugLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleplugLink")
            .field("adapter", &self.adapter_name)
            .finish_non_exhaustive()
    }
}

impl BtleplugLink {
    /// Open the first adapter and start forwarding its events to `inputs`.
    pub async fn new(inputs: InputSender) -> Result<Self> {
        let adapter = get_adapter().await?;
        Self::with_adapter(adapter, inputs).await
    }

    /// Use a specific adapter.
    pub async fn with_adapter(adapter: Adapter, inputs: InputSender) -> Result<Self> {
        let adapter_name = adapter
            .adapter_info()
            .await
            .ok()
            .and_then(|info| info.split_whitespace().next().map(str::to_string))
            .unwrap_or_else(|| "hci0".to_string());
        debug!(adapter = %adapter_name, "Using Bluetooth adapter");

        let events = adapter.events().await?;
        let current = Arc::new(RwLock::new(None));
        let signal = SharedSignal::default();
        let event_pump = tokio::spawn(pump_central_events(
            adapter.clone(),
            events,
            inputs.clone(),
            Arc::clone(&current),
            Arc::clone(&signal),
        ));

        Ok(Self {
            adapter,
            adapter_name,
            inputs,
            peripheral: RwLock::new(None),
            current,
            signal,
            rssi_max_age: DEFAULT_RSSI_MAX_AGE,
            tasks: Mutex::new(Vec::new()),
            event_pump,
        })
    }

    /// Set how old an advertised RSSI may be before reads report it stale.
    /// Match this to the proximity sampling interval.
    #[must_use]
    pub fn with_rssi_max_age(mut self, max_age: Duration) -> Self {
        self.rssi_max_age = max_age;
        self
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks();
        tasks.retain(|t| !t.is_finished());
        tasks.push(tokio::spawn(task));
    }

    async fn connected_peripheral(&self) -> Result<Peripheral> {
        self.peripheral.read().await.clone().ok_or(Error::ConnectFailed {
            address: None,
            reason: ConnectionFailureReason::Other("no active link".to_string()),
        })
    }

    async fn find_peripheral(&self, address: Address) -> Result<Peripheral> {
        let wanted = to_bdaddr(address);
        for peripheral in self.adapter.peripherals().await? {
            if let Ok(Some(props)) = peripheral.properties().await
                && props.address == wanted
            {
                return Ok(peripheral);
            }
        }
        Err(Error::connection_failed(
            Some(address.to_string()),
            ConnectionFailureReason::NotFound,
        ))
    }

    fn find_characteristic(
        peripheral: &Peripheral,
        handle: &CharacteristicHandle,
    ) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == handle.characteristic && c.service_uuid == handle.service)
            .ok_or_else(|| {
                Error::characteristic_not_found(
                    handle.characteristic.to_string(),
                    peripheral.services().len(),
                )
            })
    }
}

impl Drop for BtleplugLink {
    fn drop(&mut self) {
        self.event_pump.abort();
        for task in self.tasks().drain(..) {
            task.abort();
        }
    }
}

async fn pump_central_events(
    adapter: Adapter,
    mut events: Pin<Box<dyn Stream<Item = CentralEvent> + Send>>,
    inputs: InputSender,
    current: Arc<RwLock<Option<PeripheralId>>>,
    signal: SharedSignal,
) {
    while let Some(event) = events.next().await {
        let forwarded = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                match adapter.peripheral(&id).await {
                    Ok(peripheral) => match peripheral.properties().await {
                        Ok(Some(props)) => {
                            if let Some(rssi) = props.rssi
                                && current.read().await.as_ref() == Some(&id)
                            {
                                trace!(rssi, "Connected peripheral advertised");
                                *lock_signal(&signal) = Some(SignalReading {
                                    rssi,
                                    at: Instant::now(),
                                });
                            }
                            Some(LinkEvent::Discovered {
                                address: create_identifier(&props.address.to_string(), &id),
                                rssi: props.rssi,
                            })
                        }
                        _ => None,
                    },
                    Err(e) => {
                        trace!("Discovered peripheral vanished: {}", e);
                        None
                    }
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                if current.read().await.as_ref() == Some(&id) {
                    Some(LinkEvent::Disconnected {
                        reason: Some("link lost".to_string()),
                    })
                } else {
                    None
                }
            }
            CentralEvent::StateUpdate(state) => {
                Some(LinkEvent::AdapterPowered(state == CentralState::PoweredOn))
            }
            _ => None,
        };
        if let Some(event) = forwarded
            && inputs.send(Input::Link(event)).is_err()
        {
            break;
        }
    }
    debug!("Adapter event stream ended");
}

#[async_trait]
impl PeripheralLink for BtleplugLink {
    async fn start_scan(&self, filter: &ScanFilter) -> Result<()> {
        debug!(address = %filter.address, "Starting scan");
        self.adapter
            .start_scan(BtScanFilter::default())
            .await
            .map_err(|e| Error::ScanFailed(e.to_string()))
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    #[tracing::instrument(level = "info", skip_all, fields(address = %address))]
    async fn connect(&self, address: Address) -> Result<()> {
        let peripheral = self.find_peripheral(address).await?;
        *lock_signal(&self.signal) = None;
        *self.current.write().await = Some(peripheral.id());
        *self.peripheral.write().await = Some(peripheral.clone());

        let inputs = self.inputs.clone();
        self.spawn(async move {
            let event = match peripheral.connect().await {
                Ok(()) => LinkEvent::Connected,
                Err(e) => LinkEvent::ConnectFailed {
                    reason: ConnectionFailureReason::BleError(e.to_string()),
                },
            };
            let _ = inputs.send(Input::Link(event));
        });
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn disconnect(&self) -> Result<()> {
        for task in self.tasks().drain(..) {
            task.abort();
        }
        *self.current.write().await = None;
        let Some(peripheral) = self.peripheral.write().await.take() else {
            return Ok(());
        };
        if peripheral.is_connected().await.unwrap_or(false) {
            info!("Disconnecting from peripheral...");
            peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn bond_state(&self, address: Address) -> Result<BondState> {
        #[cfg(target_os = "linux")]
        {
            let paired = crate::bluez::is_paired(self.adapter_name.clone(), address).await?;
            Ok(if paired {
                BondState::Bonded
            } else {
                BondState::Unbonded
            })
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = address;
            Ok(BondState::Bonded)
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(address = %address))]
    async fn bond(&self, address: Address, secret: &PairingSecret) -> Result<()> {
        #[cfg(target_os = "linux")]
        {
            let adapter = self.adapter_name.clone();
            let secret = secret.clone();
            let inputs = self.inputs.clone();
            self.spawn(async move {
                let state = match crate::bluez::pair(adapter, address, secret).await {
                    Ok(()) => BondState::Bonded,
                    Err(e) => {
                        warn!("Pairing failed: {}", e);
                        BondState::Unbonded
                    }
                };
                let _ = inputs.send(Input::Link(LinkEvent::BondStateChanged(state)));
            });
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = (address, secret);
            let _ = self
                .inputs
                .send(Input::Link(LinkEvent::BondStateChanged(BondState::Bonded)));
        }
        Ok(())
    }

    async fn discover_services(&self) -> Result<()> {
        let peripheral = self.connected_peripheral().await?;
        let inputs = self.inputs.clone();
        self.spawn(async move {
            let event = match peripheral.discover_services().await {
                Ok(()) => {
                    let services: Vec<GattService> = peripheral
                        .services()
                        .into_iter()
                        .map(|s| GattService::new(s.uuid, s.characteristics.iter().map(|c| c.uuid)))
                        .collect();
                    for service in &services {
                        debug!("  Service: {}", service.uuid);
                        for characteristic in &service.characteristics {
                            debug!("    Characteristic: {}", characteristic);
                        }
                    }
                    LinkEvent::ServicesDiscovered(services)
                }
                Err(e) => LinkEvent::ServiceDiscoveryFailed {
                    reason: e.to_string(),
                },
            };
            let _ = inputs.send(Input::Link(event));
        });
        Ok(())
    }

    async fn subscribe(&self, handle: &CharacteristicHandle) -> Result<()> {
        let peripheral = self.connected_peripheral().await?;
        let characteristic = Self::find_characteristic(&peripheral, handle)?;
        peripheral.subscribe(&characteristic).await?;

        let mut notifications = peripheral.notifications().await?;
        let inputs = self.inputs.clone();
        self.spawn(async move {
            while let Some(notification) = notifications.next().await {
                let event = LinkEvent::Notification {
                    characteristic: notification.uuid,
                    value: Bytes::from(notification.value),
                };
                if inputs.send(Input::Link(event)).is_err() {
                    break;
                }
            }
            debug!("Notification stream ended");
        });
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(characteristic = %handle.characteristic, len = payload.len()))]
    async fn write(&self, handle: &CharacteristicHandle, payload: &[u8]) -> Result<()> {
        let peripheral = self.connected_peripheral().await?;
        let characteristic = Self::find_characteristic(&peripheral, handle)?;
        peripheral
            .write(&characteristic, payload, WriteType::WithResponse)
            .await
            .map_err(|e| Error::WriteFailed {
                uuid: handle.characteristic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn read_rssi(&self) -> Result<i16> {
        self.connected_peripheral()
            .await
            .map_err(|e| Error::RssiReadFailed(e.to_string()))?;
        let reading = *lock_signal(&self.signal);
        fresh_rssi(reading, Instant::now(), self.rssi_max_age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_rssi_within_max_age() {
        let at = Instant::now();
        let reading = Some(SignalReading { rssi: -72, at });
        let max_age = Duration::from_secs(2);

        assert_eq!(fresh_rssi(reading, at, max_age).unwrap(), -72);
        assert_eq!(fresh_rssi(reading, at + max_age, max_age).unwrap(), -72);
    }

    #[test]
    fn test_stale_or_missing_rssi_fails() {
        let at = Instant::now();
        let reading = Some(SignalReading { rssi: -72, at });
        let max_age = Duration::from_secs(2);

        let stale = fresh_rssi(reading, at + Duration::from_secs(3), max_age).unwrap_err();
        assert!(matches!(stale, Error::RssiReadFailed(ref reason) if reason.starts_with("stale")));
        assert!(matches!(
            fresh_rssi(None, at, max_age),
            Err(Error::RssiReadFailed(_))
        ));
    }
}
