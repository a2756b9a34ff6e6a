//! Controller event system.
//!
//! Everything observable about the controller (state transitions, signal
//! samples, proximity decisions, command outcomes, link failures) is
//! published as a [`ControllerEvent`] on a broadcast channel. Any number of
//! front ends can subscribe; a slow subscriber only lags itself.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use keyfob_types::{Command, ConnectionState, LockState, Notification, ProximityEvent};

use crate::error::FailureKind;

/// Events emitted by the controller.
///
/// All events are serializable for logging and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ControllerEvent {
    /// The connection supervisor moved between states.
    ConnectionStateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// Believed lock state or manual override changed.
    LockStateChanged {
        state: LockState,
        manual_override: bool,
    },
    /// Automatic proximity control was switched on or off.
    AutoModeChanged { enabled: bool },
    /// A signal strength sample was taken.
    RssiSampled { rssi: i16, smoothed: Option<i16> },
    /// The proximity estimator crossed a threshold.
    Proximity { event: ProximityEvent, smoothed: i16 },
    /// The peripheral pushed status text.
    Notification { notification: Notification },
    /// A command was written to the peripheral.
    CommandSent { command: Command },
    /// A command write failed.
    CommandFailed { command: Command, error: String },
    /// A command was discarded without being written.
    CommandDropped { command: Command, reason: String },
    /// A link operation failed and recovery was scheduled.
    LinkFailure { kind: FailureKind, error: String },
}

/// Sender for controller events.
pub type EventSender = broadcast::Sender<ControllerEvent>;

/// Receiver for controller events.
pub type EventReceiver = broadcast::Receiver<ControllerEvent>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: ControllerEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}
