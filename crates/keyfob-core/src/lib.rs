//! BLE controller for a vehicle lock peripheral.
//!
//! This crate keeps a Bluetooth Low Energy link to a single bonded lock
//! peripheral alive, estimates the user's proximity from the link's signal
//! strength, and turns proximity changes and user requests into lock,
//! unlock, trunk and locate commands.
//!
//! # Features
//!
//! - **Connection supervision**: scan, connect, bond and discover services,
//!   then recover from drops by reconnecting directly or rescanning
//! - **Proximity estimation**: median-smoothed RSSI with hysteresis,
//!   confirmation streaks and a debounce interval
//! - **Serialized dispatch**: commands are written one at a time in FIFO
//!   order, never concurrently
//! - **Manual override**: a manual lock keeps the vehicle locked until the
//!   peripheral reports it unlocked
//! - **Testable seams**: all radio access goes through [`PeripheralLink`];
//!   [`MockLink`] drives the whole controller without hardware
//!
//! # Platform Differences
//!
//! - **Linux**: the bond is read and created through BlueZ over D-Bus. While
//!   pairing, keyfob registers its own BlueZ agent that answers with the
//!   configured PIN.
//! - **macOS**: CoreBluetooth hides device addresses, so the configured
//!   address can never match an advertisement. Use Linux or Windows.
//! - **Windows**: the OS pairs on first use of an encrypted characteristic.
//!
//! btleplug cannot read the RSSI of an established connection. The link
//! keeps scanning while ready and uses the signal strength of the
//! peripheral's advertisements instead. A peripheral that stops advertising
//! once connected yields no fresh readings: every sample then fails as stale
//! and proximity decisions stop until it advertises again.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use keyfob_core::{BtleplugLink, Controller, ControllerConfig, ControllerEvent, input_channel};
//! use keyfob_types::PeripheralIdentity;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (tx, rx) = input_channel();
//!     let link = Arc::new(BtleplugLink::new(tx.clone()).await?);
//!     let (controller, handle) = Controller::new(
//!         PeripheralIdentity::default(),
//!         ControllerConfig::default(),
//!         link,
//!         tx,
//!         rx,
//!     )?;
//!
//!     let mut events = handle.subscribe();
//!     tokio::spawn(controller.run());
//!
//!     while let Ok(event) = events.recv().await {
//!         if let ControllerEvent::LockStateChanged { state, .. } = event {
//!             println!("Vehicle is now {}", state);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod ble;
#[cfg(target_os = "linux")]
pub mod bluez;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod lock;
pub mod messages;
pub mod mock;
pub mod proximity;
pub mod supervisor;
pub mod timers;
pub mod traits;
pub mod util;

// Re-export types and uuid modules from keyfob-types
pub use keyfob_types::types;
pub use keyfob_types::uuid as uuids;

// Core exports
pub use ble::{BtleplugLink, DEFAULT_RSSI_MAX_AGE, get_adapter};
pub use controller::{Controller, ControllerConfig, ControllerHandle};
pub use error::{ConnectionFailureReason, Error, FailureKind, Result};
pub use events::{ControllerEvent, EventDispatcher, EventReceiver, EventSender};
pub use messages::{Input, InputReceiver, InputSender, input_channel};
pub use traits::{CharacteristicHandle, GattService, LinkEvent, PeripheralLink, ScanFilter};

// Component exports
pub use dispatcher::{CommandDispatcher, CommandSender, DispatcherConfig};
pub use lock::{LockController, LockSnapshot, Origin};
pub use mock::{LinkCall, MockLink};
pub use proximity::{ProximityConfig, ProximityEstimator, RssiSample, proximity_events};
pub use supervisor::{ConnectionSupervisor, GattHandles, SupervisorConfig};
pub use timers::{MAX_TIMER_PERIOD, TimerFired, TimerKind};
pub use util::{create_identifier, format_peripheral_id};

// Re-export from keyfob-types
pub use keyfob_types::{
    Address, BondState, Command, ConnectionState, LockState, Notification, PairingSecret,
    PeripheralIdentity, ProximityEvent,
};
