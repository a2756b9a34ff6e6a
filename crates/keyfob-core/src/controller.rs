//! The controller task.
//!
//! [`Controller`] owns every piece of mutable state: the connection
//! supervisor, the proximity estimator, the lock policy and the command
//! dispatcher. It consumes [`Input`]s one at a time, so a link callback, a
//! timer expiry and a user request can never interleave.
//!
//! Front ends talk to it through a cloneable [`ControllerHandle`], which
//! also exposes the connection and lock state as watch channels and the
//! full event stream as a broadcast subscription.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use keyfob_core::{BtleplugLink, Controller, ControllerConfig, input_channel};
//! use keyfob_types::PeripheralIdentity;
//!
//! # async fn example() -> keyfob_core::Result<()> {
//! let (tx, rx) = input_channel();
//! let link = Arc::new(BtleplugLink::new(tx.clone()).await?);
//! let (controller, handle) =
//!     Controller::new(PeripheralIdentity::default(), ControllerConfig::default(), link, tx, rx)?;
//! tokio::spawn(controller.run());
//!
//! handle.lock().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use keyfob_types::{Command, ConnectionState, Notification, PeripheralIdentity};

use crate::dispatcher::{CommandDispatcher, CommandSender, DispatcherConfig};
use crate::error::{Error, Result};
use crate::events::{ControllerEvent, EventDispatcher, EventReceiver};
use crate::lock::{LockController, LockSnapshot, Origin};
use crate::messages::{Input, InputReceiver, InputSender};
use crate::proximity::{ProximityConfig, ProximityEstimator, RssiSample};
use crate::supervisor::{ConnectionSupervisor, SupervisorConfig};
use crate::timers::TimerKind;
use crate::traits::{LinkEvent, PeripheralLink};

/// Everything tunable about the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Connection lifecycle timing.
    pub supervisor: SupervisorConfig,
    /// Proximity estimation.
    pub proximity: ProximityConfig,
    /// Command queue.
    pub dispatcher: DispatcherConfig,
    /// Whether proximity drives lock/unlock at startup. Default: true.
    pub auto_mode: bool,
    /// Capacity of the event broadcast channel. Default: 100.
    pub event_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            proximity: ProximityConfig::default(),
            dispatcher: DispatcherConfig::default(),
            auto_mode: true,
            event_capacity: 100,
        }
    }
}

impl ControllerConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.supervisor.validate()?;
        self.proximity.validate()?;
        self.dispatcher.validate()?;
        if self.event_capacity == 0 {
            return Err(Error::invalid_config("event_capacity must be > 0"));
        }
        Ok(())
    }
}

/// Cloneable front-end handle to a running [`Controller`].
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    inputs: InputSender,
    events: EventDispatcher,
    connection: watch::Receiver<ConnectionState>,
    lock: watch::Receiver<LockSnapshot>,
}

impl ControllerHandle {
    /// Queue a command.
    ///
    /// Resolves once the controller has accepted or refused it; the write
    /// itself is reported later as [`ControllerEvent::CommandSent`] or
    /// [`ControllerEvent::CommandFailed`].
    pub async fn send(&self, command: Command) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.inputs
            .send(Input::Manual {
                command,
                reply: Some(reply),
            })
            .map_err(|_| Error::Cancelled)?;
        response.await.map_err(|_| Error::Cancelled)?
    }

    /// Lock the vehicle and hold it locked against proximity unlock.
    pub async fn lock(&self) -> Result<()> {
        self.send(Command::Lock).await
    }

    /// Unlock the vehicle and release any manual override.
    pub async fn unlock(&self) -> Result<()> {
        self.send(Command::Unlock).await
    }

    /// Release the trunk.
    pub async fn trunk(&self) -> Result<()> {
        self.send(Command::Trunk).await
    }

    /// Make the vehicle signal its position.
    pub async fn locate(&self) -> Result<()> {
        self.send(Command::Locate).await
    }

    /// Enable or disable proximity control.
    pub fn set_auto_mode(&self, enabled: bool) -> Result<()> {
        self.inputs
            .send(Input::SetAutoMode(enabled))
            .map_err(|_| Error::Cancelled)
    }

    /// Tear the link down and scan again.
    pub fn restart(&self) -> Result<()> {
        self.inputs.send(Input::Restart).map_err(|_| Error::Cancelled)
    }

    /// Stop the controller. Stopping a stopped controller is not an error.
    pub fn shutdown(&self) {
        let _ = self.inputs.send(Input::Shutdown);
    }

    /// Subscribe to controller events.
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    /// Current lock status.
    pub fn lock_state(&self) -> LockSnapshot {
        self.lock.borrow().clone()
    }

    /// Observe connection state changes.
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    /// Observe lock status changes.
    pub fn watch_lock(&self) -> watch::Receiver<LockSnapshot> {
        self.lock.clone()
    }
}

/// Owns the controller state and processes inputs.
pub struct Controller {
    identity: PeripheralIdentity,
    link: Arc<dyn PeripheralLink>,
    supervisor: ConnectionSupervisor,
    estimator: ProximityEstimator,
    lock: LockController,
    dispatcher: CommandDispatcher,
    commands: CommandSender,
    inputs: InputReceiver,
    events: EventDispatcher,
    lock_state: watch::Sender<LockSnapshot>,
    observed: ConnectionState,
    rssi_timeout: Duration,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("supervisor", &self.supervisor)
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Build a controller and its handle.
    ///
    /// `tx` must be the sender paired with `rx`; the link should report its
    /// events on a clone of it. Must be called within a tokio runtime.
    pub fn new(
        identity: PeripheralIdentity,
        config: ControllerConfig,
        link: Arc<dyn PeripheralLink>,
        tx: InputSender,
        rx: InputReceiver,
    ) -> Result<(Self, ControllerHandle)> {
        config.validate()?;

        let events = EventDispatcher::new(config.event_capacity);
        let estimator = ProximityEstimator::new(config.proximity.clone())?;
        let sample_interval = config.proximity.sample_interval;
        let supervisor = ConnectionSupervisor::new(
            identity.clone(),
            config.supervisor,
            Arc::clone(&link),
            tx.clone(),
            events.clone(),
        )
        .with_rssi_interval(sample_interval);
        let dispatcher =
            CommandDispatcher::spawn(Arc::clone(&link), config.dispatcher, events.clone());
        let commands = dispatcher.sender();
        let lock = LockController::new(config.auto_mode);
        let (lock_state, lock_rx) = watch::channel(lock.snapshot());

        let handle = ControllerHandle {
            inputs: tx,
            events: events.clone(),
            connection: supervisor.watch(),
            lock: lock_rx,
        };
        let controller = Self {
            identity,
            link,
            supervisor,
            estimator,
            lock,
            dispatcher,
            commands,
            inputs: rx,
            events,
            lock_state,
            observed: ConnectionState::Idle,
            rssi_timeout: sample_interval,
        };
        Ok((controller, handle))
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    /// Current lock status.
    pub fn lock_snapshot(&self) -> LockSnapshot {
        self.lock.snapshot()
    }

    /// Start the supervisor and process inputs until shut down.
    pub async fn run(mut self) {
        self.start().await;
        while let Some(input) = self.inputs.recv().await {
            if !self.handle(input).await {
                break;
            }
        }
        self.supervisor.shutdown().await;
        self.sync_lifecycle();
        self.dispatcher.shutdown().await;
        info!("Controller stopped");
    }

    /// Start the supervisor.
    pub async fn start(&mut self) {
        self.supervisor.start().await;
        self.sync_lifecycle();
    }

    /// Receive and process the next input. Returns `false` once the
    /// controller should stop.
    pub async fn step(&mut self) -> bool {
        match self.inputs.recv().await {
            Some(input) => self.handle(input).await,
            None => false,
        }
    }

    /// Process one input. Returns `false` once the controller should stop.
    pub async fn handle(&mut self, input: Input) -> bool {
        let keep_running = match input {
            Input::Link(LinkEvent::Notification {
                characteristic,
                value,
            }) => {
                if characteristic == self.identity.notify_characteristic() {
                    self.on_notification(Notification::parse(&value));
                } else {
                    debug!(%characteristic, "Notification from unexpected characteristic");
                }
                true
            }
            Input::Link(event) => {
                self.supervisor.handle_link_event(event).await;
                true
            }
            Input::Timer(fired) => {
                match self.supervisor.accept_timer(fired) {
                    Some(TimerKind::RssiTick) => self.sample_rssi().await,
                    Some(kind) => self.supervisor.on_timer(kind).await,
                    None => {}
                }
                true
            }
            Input::Manual { command, reply } => {
                let result = self.on_manual(command);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
                true
            }
            Input::SetAutoMode(enabled) => {
                if self.lock.auto_mode() != enabled {
                    self.lock.set_auto_mode(enabled);
                    self.events
                        .send(ControllerEvent::AutoModeChanged { enabled });
                    self.publish_lock();
                }
                true
            }
            Input::Restart => {
                self.supervisor.restart().await;
                true
            }
            Input::Shutdown => {
                self.supervisor.shutdown().await;
                false
            }
        };
        self.sync_lifecycle();
        keep_running
    }

    fn on_manual(&mut self, command: Command) -> Result<()> {
        let connection = self.supervisor.state();
        if !connection.is_ready() {
            info!(%command, %connection, "Rejecting command while not ready");
            self.events.send(ControllerEvent::CommandDropped {
                command,
                reason: format!("peripheral not ready ({connection})"),
            });
            return Err(Error::NotReady(command));
        }
        self.commands.enqueue(command)?;
        info!(%command, "Manual command queued");
        self.lock.record_queued(command, Origin::Manual);
        self.publish_lock();
        Ok(())
    }

    fn on_notification(&mut self, notification: Notification) {
        info!(%notification, "Peripheral status");
        self.lock.on_notification(&notification);
        self.events
            .send(ControllerEvent::Notification { notification });
        self.publish_lock();
    }

    async fn sample_rssi(&mut self) {
        if !self.supervisor.state().is_ready() {
            return;
        }
        let rssi = match tokio::time::timeout(self.rssi_timeout, self.link.read_rssi()).await {
            Ok(Ok(rssi)) => rssi,
            Ok(Err(e)) => {
                self.report_rssi_failure(e);
                return;
            }
            Err(_) => {
                self.report_rssi_failure(Error::timeout("read RSSI", self.rssi_timeout));
                return;
            }
        };

        let decision = self.estimator.push(RssiSample::now(rssi));
        let smoothed = self.estimator.smoothed();
        self.events
            .send(ControllerEvent::RssiSampled { rssi, smoothed });

        let Some(event) = decision else {
            return;
        };
        info!(%event, ?smoothed, "Proximity changed");
        if let Some(smoothed) = smoothed {
            self.events
                .send(ControllerEvent::Proximity { event, smoothed });
        }

        let connection = self.supervisor.state();
        let Some(command) = self.lock.decide(event, connection) else {
            return;
        };
        match self.commands.enqueue(command) {
            Ok(()) => {
                info!(%command, "Automatic command queued");
                self.lock.record_queued(command, Origin::Automatic);
                self.publish_lock();
            }
            Err(e) => warn!(%command, "Automatic command not queued: {}", e),
        }
    }

    fn report_rssi_failure(&self, error: Error) {
        warn!("RSSI read failed: {}", error);
        self.events.send(ControllerEvent::LinkFailure {
            kind: error.kind(),
            error: error.to_string(),
        });
    }

    /// Bring the dispatcher, estimator and lock state in line with the
    /// connection state after an input has been handled.
    fn sync_lifecycle(&mut self) {
        let now = self.supervisor.state();
        let before = std::mem::replace(&mut self.observed, now);
        if before == now {
            return;
        }

        let left_ready = before.is_ready() && !now.is_ready();
        let link_gone = matches!(now, ConnectionState::Idle | ConnectionState::Disconnected);
        if left_ready || link_gone {
            self.dispatcher.deactivate();
            self.estimator.reset();
            self.lock.reset();
            self.publish_lock();
        }

        if now.is_ready()
            && let Some(handles) = self.supervisor.handles()
        {
            self.dispatcher.activate(handles.write);
        }
    }

    fn publish_lock(&mut self) {
        let snapshot = self.lock.snapshot();
        if *self.lock_state.borrow() == snapshot {
            return;
        }
        let previous = self.lock_state.send_replace(snapshot.clone());
        if previous.state != snapshot.state
            || previous.manual_override != snapshot.manual_override
        {
            self.events.send(ControllerEvent::LockStateChanged {
                state: snapshot.state,
                manual_override: snapshot.manual_override,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::input_channel;
    use crate::mock::MockLink;
    use keyfob_types::{LockState, ProximityEvent};

    async fn ready_controller(link: &Arc<MockLink>) -> (Controller, ControllerHandle) {
        let (tx, rx) = input_channel();
        let dyn_link: Arc<dyn PeripheralLink> = link.clone();
        let (mut controller, handle) = Controller::new(
            PeripheralIdentity::default(),
            ControllerConfig::default(),
            dyn_link,
            tx,
            rx,
        )
        .unwrap();
        link.set_bond_state(keyfob_types::BondState::Bonded);

        controller.start().await;
        for event in [
            LinkEvent::Discovered {
                address: "5C:01:3B:96:DD:56".into(),
                rssi: None,
            },
            LinkEvent::Connected,
            LinkEvent::ServicesDiscovered(vec![crate::traits::GattService::new(
                keyfob_types::uuids::LOCK_SERVICE,
                [
                    keyfob_types::uuids::COMMAND_WRITE,
                    keyfob_types::uuids::STATUS_NOTIFY,
                ],
            )]),
        ] {
            controller.handle(Input::Link(event)).await;
        }
        assert_eq!(controller.connection_state(), ConnectionState::Ready);
        (controller, handle)
    }

    fn notification(text: &str) -> Input {
        Input::Link(LinkEvent::Notification {
            characteristic: keyfob_types::uuids::STATUS_NOTIFY,
            value: bytes::Bytes::copy_from_slice(text.as_bytes()),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_command_rejected_when_not_ready() {
        let link = Arc::new(MockLink::new());
        let (tx, rx) = input_channel();
        let dyn_link: Arc<dyn PeripheralLink> = link.clone();
        let (mut controller, handle) = Controller::new(
            PeripheralIdentity::default(),
            ControllerConfig::default(),
            dyn_link,
            tx,
            rx,
        )
        .unwrap();
        controller.start().await;

        let before = controller.lock_snapshot();
        let (reply, response) = oneshot::channel();
        controller
            .handle(Input::Manual {
                command: Command::Lock,
                reply: Some(reply),
            })
            .await;
        assert!(matches!(
            response.await.unwrap(),
            Err(Error::NotReady(Command::Lock))
        ));
        assert_eq!(controller.lock_snapshot(), before);
        assert_eq!(handle.lock_state(), before);
        assert!(link.written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_lock_sets_override() {
        let link = Arc::new(MockLink::new());
        let (mut controller, handle) = ready_controller(&link).await;

        controller
            .handle(Input::Manual {
                command: Command::Lock,
                reply: None,
            })
            .await;
        let snapshot = handle.lock_state();
        assert_eq!(snapshot.state, LockState::Locked);
        assert!(snapshot.manual_override);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifications_update_lock_state() {
        let link = Arc::new(MockLink::new());
        let (mut controller, handle) = ready_controller(&link).await;

        controller
            .handle(Input::Manual {
                command: Command::Lock,
                reply: None,
            })
            .await;
        controller.handle(notification("Unlocked")).await;
        let snapshot = handle.lock_state();
        assert_eq!(snapshot.state, LockState::Unlocked);
        assert!(!snapshot.manual_override);
        assert_eq!(snapshot.last_notification.as_deref(), Some("Unlocked"));

        // Notifications on other characteristics are ignored.
        controller
            .handle(Input::Link(LinkEvent::Notification {
                characteristic: keyfob_types::uuids::COMMAND_WRITE,
                value: bytes::Bytes::from_static(b"Locked"),
            }))
            .await;
        assert_eq!(handle.lock_state().state, LockState::Unlocked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_resets_session() {
        let link = Arc::new(MockLink::new());
        let (mut controller, handle) = ready_controller(&link).await;
        controller.handle(notification("Locked")).await;
        assert_eq!(handle.lock_state().state, LockState::Locked);

        controller
            .handle(Input::Link(LinkEvent::Disconnected { reason: None }))
            .await;
        assert_eq!(handle.connection_state(), ConnectionState::Disconnected);
        assert_eq!(handle.lock_state().state, LockState::Unknown);
        assert!(matches!(
            controller.commands.enqueue(Command::Lock),
            Err(Error::NotReady(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_mode_toggle_publishes() {
        let link = Arc::new(MockLink::new());
        let (mut controller, handle) = ready_controller(&link).await;
        let mut events = handle.subscribe();

        controller.handle(Input::SetAutoMode(false)).await;
        assert!(!handle.lock_state().auto_mode);
        assert_eq!(
            events.try_recv().unwrap(),
            ControllerEvent::AutoModeChanged { enabled: false }
        );

        // Same value again is a no-op.
        controller.handle(Input::SetAutoMode(false)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rssi_failure_keeps_link() {
        let link = Arc::new(MockLink::new());
        link.fail_rssi(true);
        let (mut controller, handle) = ready_controller(&link).await;
        let mut events = handle.subscribe();

        controller.sample_rssi().await;
        assert_eq!(controller.connection_state(), ConnectionState::Ready);
        assert!(matches!(
            events.try_recv().unwrap(),
            ControllerEvent::LinkFailure {
                kind: crate::error::FailureKind::RssiRead,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_near_unlocks_once() {
        let link = Arc::new(MockLink::new());
        link.push_rssi([-70, -72, -71, -69, -70, -71, -70]);
        let (mut controller, handle) = ready_controller(&link).await;
        let mut events = handle.subscribe();

        for _ in 0..7 {
            controller.sample_rssi().await;
        }
        assert_eq!(handle.lock_state().state, LockState::Unlocked);

        let proximity: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|e| match e {
                ControllerEvent::Proximity { event, .. } => Some(event),
                _ => None,
            })
            .collect();
        assert_eq!(proximity, vec![ProximityEvent::Near]);
    }

    #[test]
    fn test_config_validation() {
        assert!(ControllerConfig::default().validate().is_ok());
        let config = ControllerConfig {
            event_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
