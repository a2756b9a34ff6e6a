//! Inputs consumed by the controller task.
//!
//! The controller owns all mutable state and processes one input at a time.
//! Link callbacks, timer expiries and front-end requests are all funneled
//! through a single unbounded channel so their handling never interleaves.
//!
//! ```text
//! +-------------+   LinkEvent    +--------------+
//! |  BLE link   | ------------> |              |
//! +-------------+               |              |
//! +-------------+  TimerFired   |  Controller  | ---> ControllerEvent
//! |   Timers    | ------------> |    task      |      (broadcast)
//! +-------------+               |              |
//! +-------------+ Manual/Restart|              |
//! |   Handle    | ------------> |              |
//! +-------------+               +--------------+
//! ```

use tokio::sync::{mpsc, oneshot};

use keyfob_types::Command;

use crate::error::Result;
use crate::timers::TimerFired;
use crate::traits::LinkEvent;

/// One unit of work for the controller task.
#[derive(Debug)]
pub enum Input {
    /// Completion or notice from the BLE link.
    Link(LinkEvent),
    /// A timer expired.
    Timer(TimerFired),
    /// A user-initiated command.
    Manual {
        /// The command to send.
        command: Command,
        /// Receives whether the command was accepted into the queue.
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    /// Enable or disable proximity-driven lock/unlock.
    SetAutoMode(bool),
    /// Tear down and start over from scanning.
    Restart,
    /// Tear down and stop the controller task.
    Shutdown,
}

impl From<LinkEvent> for Input {
    fn from(event: LinkEvent) -> Self {
        Input::Link(event)
    }
}

/// Sender half of the controller input channel.
pub type InputSender = mpsc::UnboundedSender<Input>;

/// Receiver half of the controller input channel.
pub type InputReceiver = mpsc::UnboundedReceiver<Input>;

/// Create the controller input channel.
pub fn input_channel() -> (InputSender, InputReceiver) {
    mpsc::unbounded_channel()
}
