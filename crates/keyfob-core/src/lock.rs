//! Lock state tracking and the proximity decision policy.
//!
//! The controller believes the vehicle is `Locked`, `Unlocked` or
//! `Unknown`. Belief is updated optimistically when a lock or unlock
//! command is queued and authoritatively when the peripheral reports its
//! state.
//!
//! A manual lock sets the *manual override*. While it is set, walking up to
//! the vehicle does not unlock it. The override clears on a manual unlock or
//! when the peripheral reports it was unlocked by any means.
//!
//! | Trigger | Guard | Command | New state | Override |
//! |---------|-------|---------|-----------|----------|
//! | Near | Ready, not Unlocked, no override | UNLOCK | Unlocked | unchanged |
//! | Far | Ready, Unlocked | LOCK | Locked | unchanged |
//! | Manual lock | Ready | LOCK | Locked | set |
//! | Manual unlock | Ready | UNLOCK | Unlocked | cleared |
//! | Trunk / locate | Ready | TRUNK / LOCATE | unchanged | unchanged |
//! | "Locked" notice | any | | Locked | unchanged |
//! | "Unlocked" notice | any | | Unlocked | cleared |

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use keyfob_types::{Command, ConnectionState, LockState, Notification, ProximityEvent};

/// Who asked for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A user request.
    Manual,
    /// A proximity decision.
    Automatic,
}

/// Observable lock status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSnapshot {
    /// Believed lock state.
    pub state: LockState,
    /// Whether proximity unlock is suppressed by a manual lock.
    pub manual_override: bool,
    /// Whether proximity control is enabled at all.
    pub auto_mode: bool,
    /// Text of the most recent status notification.
    pub last_notification: Option<String>,
}

impl Default for LockSnapshot {
    fn default() -> Self {
        Self {
            state: LockState::Unknown,
            manual_override: false,
            auto_mode: true,
            last_notification: None,
        }
    }
}

/// Tracks lock state and decides what proximity changes should do.
#[derive(Debug, Clone)]
pub struct LockController {
    state: LockState,
    manual_override: bool,
    auto_mode: bool,
    last_notification: Option<Notification>,
}

impl Default for LockController {
    fn default() -> Self {
        Self::new(true)
    }
}

impl LockController {
    /// Create a controller in the `Unknown` state.
    pub fn new(auto_mode: bool) -> Self {
        Self {
            state: LockState::Unknown,
            manual_override: false,
            auto_mode,
            last_notification: None,
        }
    }

    /// Believed lock state.
    pub fn state(&self) -> LockState {
        self.state
    }

    /// Whether a manual lock is suppressing proximity unlock.
    pub fn manual_override(&self) -> bool {
        self.manual_override
    }

    /// Whether proximity control is enabled.
    pub fn auto_mode(&self) -> bool {
        self.auto_mode
    }

    /// Current observable status.
    pub fn snapshot(&self) -> LockSnapshot {
        LockSnapshot {
            state: self.state,
            manual_override: self.manual_override,
            auto_mode: self.auto_mode,
            last_notification: self.last_notification.as_ref().map(ToString::to_string),
        }
    }

    /// Enable or disable proximity control.
    pub fn set_auto_mode(&mut self, enabled: bool) {
        if self.auto_mode != enabled {
            info!(enabled, "Automatic proximity control changed");
        }
        self.auto_mode = enabled;
    }

    /// The command a proximity change calls for, if any.
    ///
    /// Does not change state; call [`LockController::record_queued`] once
    /// the command has been accepted by the dispatcher.
    pub fn decide(&self, event: ProximityEvent, connection: ConnectionState) -> Option<Command> {
        if !connection.is_ready() {
            debug!(%event, %connection, "Ignoring proximity change while not ready");
            return None;
        }
        if !self.auto_mode {
            debug!(%event, "Ignoring proximity change in manual mode");
            return None;
        }
        match event {
            ProximityEvent::Near if self.manual_override => {
                debug!("Near, but manual override holds the lock");
                None
            }
            ProximityEvent::Near if self.state != LockState::Unlocked => Some(Command::Unlock),
            ProximityEvent::Far if self.state == LockState::Unlocked => Some(Command::Lock),
            _ => None,
        }
    }

    /// Apply the optimistic effect of a command that has been queued.
    pub fn record_queued(&mut self, command: Command, origin: Origin) {
        match (command, origin) {
            (Command::Lock, Origin::Manual) => {
                self.state = LockState::Locked;
                self.manual_override = true;
            }
            (Command::Lock, Origin::Automatic) => {
                self.state = LockState::Locked;
            }
            (Command::Unlock, Origin::Manual) => {
                self.state = LockState::Unlocked;
                self.manual_override = false;
            }
            (Command::Unlock, Origin::Automatic) => {
                self.state = LockState::Unlocked;
            }
            (Command::Trunk | Command::Locate, _) => {}
        }
    }

    /// Apply a status notification from the peripheral.
    pub fn on_notification(&mut self, notification: &Notification) {
        match notification.lock_state() {
            Some(LockState::Unlocked) => {
                self.state = LockState::Unlocked;
                self.manual_override = false;
            }
            Some(state) => self.state = state,
            None => {}
        }
        self.last_notification = Some(notification.clone());
    }

    /// Forget everything learned during the session. Auto mode is kept.
    pub fn reset(&mut self) {
        self.state = LockState::Unknown;
        self.manual_override = false;
        self.last_notification = None;
    }
}
