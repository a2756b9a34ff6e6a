//! Connection lifecycle supervision.
//!
//! The supervisor owns the link to the peripheral and drives it through
//!
//! ```text
//! Idle ─► Scanning ─► Connecting ─► [Bonding] ─► DiscoveringServices ─► Ready
//!            ▲                                                            │
//!            └──────────────── Disconnected ◄─────────── any failure ─────┘
//! ```
//!
//! Every failure lands in `Disconnected` and schedules a retry: scan
//! failures back off for [`SupervisorConfig::scan_retry_delay`], everything
//! else waits [`SupervisorConfig::reconnect_delay`]. A peripheral that is
//! already bonded is reconnected directly once per disconnection; if that
//! attempt fails the next one scans. A periodic supervisory tick restarts a
//! supervisor that found itself disconnected with nothing scheduled.
//!
//! When the adapter is powered off the supervisor parks in `Disconnected`
//! without retrying and resumes scanning when power returns.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use keyfob_types::{BondState, ConnectionState, PeripheralIdentity};

use crate::error::{Error, FailureKind, Result};
use crate::events::{ControllerEvent, EventDispatcher};
use crate::messages::InputSender;
use crate::timers::{MAX_TIMER_PERIOD, TimerFired, TimerKind, Timers};
use crate::traits::{CharacteristicHandle, GattService, LinkEvent, PeripheralLink, ScanFilter};

/// Timing for the connection supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Upper bound on connect, bond and service discovery together.
    /// Default: 10 seconds.
    pub connect_timeout: Duration,
    /// Wait after a disconnection or link failure. Default: 5 seconds.
    pub reconnect_delay: Duration,
    /// Wait after a scan failure. Default: 30 seconds.
    pub scan_retry_delay: Duration,
    /// Period of the supervisory check. Default: 5 seconds.
    pub supervisor_tick: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            scan_retry_delay: Duration::from_secs(30),
            supervisor_tick: Duration::from_secs(5),
        }
    }
}

impl SupervisorConfig {
    /// Set the connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the reconnect delay.
    #[must_use]
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the scan retry delay.
    #[must_use]
    pub fn scan_retry_delay(mut self, delay: Duration) -> Self {
        self.scan_retry_delay = delay;
        self
    }

    /// Set the supervisory tick period.
    #[must_use]
    pub fn supervisor_tick(mut self, period: Duration) -> Self {
        self.supervisor_tick = period;
        self
    }

    /// Validate the configuration. All durations must be non-zero and no
    /// longer than [`MAX_TIMER_PERIOD`].
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("reconnect_delay", self.reconnect_delay),
            ("scan_retry_delay", self.scan_retry_delay),
            ("supervisor_tick", self.supervisor_tick),
        ] {
            if value.is_zero() {
                return Err(Error::invalid_config(format!("{name} must be > 0")));
            }
            if value > MAX_TIMER_PERIOD {
                return Err(Error::invalid_config(format!(
                    "{name} must be at most {}s, got {}s",
                    MAX_TIMER_PERIOD.as_secs(),
                    value.as_secs()
                )));
            }
        }
        Ok(())
    }
}

/// The resolved characteristics of a ready link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattHandles {
    /// Where commands are written.
    pub write: CharacteristicHandle,
    /// Where status notifications come from.
    pub notify: CharacteristicHandle,
}

/// Drives the link to the peripheral and recovers it on failure.
pub struct ConnectionSupervisor {
    identity: PeripheralIdentity,
    config: SupervisorConfig,
    link: Arc<dyn PeripheralLink>,
    timers: Timers,
    state: watch::Sender<ConnectionState>,
    events: EventDispatcher,
    handles: Option<GattHandles>,
    started: bool,
    bonded: bool,
    adapter_powered: bool,
    attempting_direct: bool,
    direct_reconnect_failed: bool,
    rssi_interval: Option<Duration>,
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("address", &self.identity.address())
            .field("state", &self.state())
            .field("bonded", &self.bonded)
            .field("adapter_powered", &self.adapter_powered)
            .finish_non_exhaustive()
    }
}

impl ConnectionSupervisor {
    /// Create an idle supervisor. Timer expiries are reported on `inputs`.
    pub fn new(
        identity: PeripheralIdentity,
        config: SupervisorConfig,
        link: Arc<dyn PeripheralLink>,
        inputs: InputSender,
        events: EventDispatcher,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            identity,
            config,
            link,
            timers: Timers::new(inputs),
            state,
            events,
            handles: None,
            started: false,
            bonded: false,
            adapter_powered: true,
            attempting_direct: false,
            direct_reconnect_failed: false,
            rssi_interval: None,
        }
    }

    /// Also arm a repeating [`TimerKind::RssiTick`] with this period while ready.
    #[must_use]
    pub fn with_rssi_interval(mut self, interval: Duration) -> Self {
        self.rssi_interval = Some(interval);
        self
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe state changes.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Resolved characteristics, present only while ready.
    pub fn handles(&self) -> Option<&GattHandles> {
        self.handles.as_ref()
    }

    /// Whether the peripheral is known to be bonded.
    pub fn is_bonded(&self) -> bool {
        self.bonded
    }

    /// Whether a timer of this kind is pending.
    pub fn is_timer_armed(&self, kind: TimerKind) -> bool {
        self.timers.is_armed(kind)
    }

    // --- Lifecycle ---

    /// Begin scanning. A no-op if already started.
    pub async fn start(&mut self) {
        if self.started {
            debug!("Supervisor already started");
            return;
        }
        info!(address = %self.identity.address(), "Starting connection supervisor");
        self.started = true;
        self.timers
            .arm_repeating(TimerKind::SupervisorTick, self.config.supervisor_tick);
        self.start_scan().await;
    }

    /// Tear everything down and return to `Idle`. Safe to call repeatedly.
    pub async fn shutdown(&mut self) {
        if !self.started && self.state() == ConnectionState::Idle {
            return;
        }
        info!("Stopping connection supervisor");
        self.teardown().await;
        self.timers.cancel_all();
        self.started = false;
        self.attempting_direct = false;
        self.direct_reconnect_failed = false;
        self.set_state(ConnectionState::Idle);
    }

    /// Tear everything down and scan again.
    pub async fn restart(&mut self) {
        info!("Restarting connection supervisor");
        self.shutdown().await;
        self.start().await;
    }

    // --- Inputs ---

    /// Handle a completion or notice from the link.
    pub async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Discovered { address, rssi } => self.on_discovered(&address, rssi).await,
            LinkEvent::ScanFailed { reason } => {
                if self.state() == ConnectionState::Scanning {
                    self.fail(Error::ScanFailed(reason)).await;
                }
            }
            LinkEvent::Connected => self.on_connected().await,
            LinkEvent::ConnectFailed { reason } => {
                if self.is_linking() {
                    self.fail(Error::connection_failed(
                        Some(self.identity.address().to_string()),
                        reason,
                    ))
                    .await;
                }
            }
            LinkEvent::Disconnected { reason } => self.on_disconnected(reason).await,
            LinkEvent::BondStateChanged(state) => self.on_bond_state(state).await,
            LinkEvent::ServicesDiscovered(services) => self.on_services_discovered(&services).await,
            LinkEvent::ServiceDiscoveryFailed { reason } => {
                if self.state() == ConnectionState::DiscoveringServices {
                    self.fail(Error::ServiceDiscoveryFailed(reason)).await;
                }
            }
            LinkEvent::AdapterPowered(on) => self.on_adapter_powered(on).await,
            LinkEvent::Notification { .. } => {
                trace!("Notification reached supervisor, ignoring");
            }
        }
    }

    /// Validate a timer expiry. Returns the kind if it is current.
    pub fn accept_timer(&mut self, fired: TimerFired) -> Option<TimerKind> {
        self.timers.accept(fired).then_some(fired.kind)
    }

    /// Act on an accepted timer expiry. [`TimerKind::RssiTick`] is left to the caller.
    pub async fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::ScanRetry => {
                if matches!(self.state(), ConnectionState::Disconnected) {
                    self.start_scan().await;
                }
            }
            TimerKind::ReconnectDelay => self.reconnect().await,
            TimerKind::ConnectTimeout => {
                if self.is_linking() {
                    self.fail(Error::timeout(
                        format!("connect to {}", self.identity.address()),
                        self.config.connect_timeout,
                    ))
                    .await;
                }
            }
            TimerKind::SupervisorTick => self.tick().await,
            TimerKind::RssiTick => {}
        }
    }

    // --- Transitions ---

    #[tracing::instrument(level = "info", skip_all, fields(address = %self.identity.address()))]
    async fn start_scan(&mut self) {
        if !self.adapter_powered {
            debug!("Adapter powered off, not scanning");
            return;
        }
        if self.is_linking() || self.state() == ConnectionState::Ready {
            debug!(state = %self.state(), "Link in progress, not scanning");
            return;
        }
        self.timers.cancel(TimerKind::ScanRetry);
        self.timers.cancel(TimerKind::ReconnectDelay);
        self.attempting_direct = false;

        if let Err(e) = self.link.stop_scan().await {
            debug!("Stopping previous scan failed: {}", e);
        }
        match self.link.start_scan(&self.scan_filter()).await {
            Ok(()) => {
                info!("Scanning for peripheral");
                self.set_state(ConnectionState::Scanning);
            }
            Err(Error::ScanFailed(reason)) => self.fail(Error::ScanFailed(reason)).await,
            Err(e) => self.fail(Error::ScanFailed(e.to_string())).await,
        }
    }

    async fn on_discovered(&mut self, address: &str, rssi: Option<i16>) {
        if self.state() != ConnectionState::Scanning {
            return;
        }
        if !self.identity.matches_address(address) {
            trace!(address, "Ignoring other device");
            return;
        }
        info!(address, ?rssi, "Found peripheral");
        if let Err(e) = self.link.stop_scan().await {
            debug!("Stopping scan failed: {}", e);
        }
        self.connect().await;
    }

    #[tracing::instrument(level = "info", skip_all, fields(address = %self.identity.address(), timeout_secs = self.config.connect_timeout.as_secs()))]
    async fn connect(&mut self) {
        self.set_state(ConnectionState::Connecting);
        self.timers
            .arm(TimerKind::ConnectTimeout, self.config.connect_timeout);
        info!("Connecting...");
        if let Err(e) = self.link.connect(self.identity.address()).await {
            self.fail(e).await;
        }
    }

    async fn on_connected(&mut self) {
        if self.state() != ConnectionState::Connecting {
            debug!(state = %self.state(), "Unexpected connect completion, ignoring");
            return;
        }
        info!("Connected!");
        let address = self.identity.address();
        match self.link.bond_state(address).await {
            Ok(BondState::Bonded) => {
                self.bonded = true;
                self.begin_discovery().await;
            }
            Ok(BondState::Bonding) => {
                debug!("Pairing already in progress");
                self.set_state(ConnectionState::Bonding);
            }
            Ok(BondState::Unbonded) => {
                self.bonded = false;
                self.set_state(ConnectionState::Bonding);
                info!("Pairing with peripheral");
                if let Err(e) = self.link.bond(address, self.identity.secret()).await {
                    self.fail(Error::BondFailed(e.to_string())).await;
                }
            }
            Err(e) => self.fail(Error::BondFailed(e.to_string())).await,
        }
    }

    async fn on_bond_state(&mut self, bond: BondState) {
        debug!(?bond, state = %self.state(), "Bond state changed");
        match bond {
            BondState::Bonded => {
                self.bonded = true;
                if self.state() == ConnectionState::Bonding {
                    info!("Paired");
                    self.begin_discovery().await;
                }
            }
            BondState::Unbonded => {
                self.bonded = false;
                if self.state() == ConnectionState::Bonding {
                    self.fail(Error::BondFailed("pairing rejected".to_string()))
                        .await;
                }
            }
            BondState::Bonding => {}
        }
    }

    async fn begin_discovery(&mut self) {
        self.set_state(ConnectionState::DiscoveringServices);
        info!("Discovering services...");
        if let Err(e) = self.link.discover_services().await {
            self.fail(Error::ServiceDiscoveryFailed(e.to_string())).await;
        }
    }

    async fn on_services_discovered(&mut self, services: &[GattService]) {
        if self.state() != ConnectionState::DiscoveringServices {
            debug!(state = %self.state(), "Unexpected discovery result, ignoring");
            return;
        }
        debug!("Found {} services", services.len());

        let handles = match self.resolve_handles(services) {
            Ok(handles) => handles,
            Err(e) => {
                self.fail(e).await;
                return;
            }
        };
        if let Err(e) = self.link.subscribe(&handles.notify).await {
            self.fail(Error::ServiceDiscoveryFailed(format!(
                "enabling notifications failed: {e}"
            )))
            .await;
            return;
        }

        self.timers.cancel(TimerKind::ConnectTimeout);
        self.handles = Some(handles);
        self.attempting_direct = false;
        self.direct_reconnect_failed = false;
        self.set_state(ConnectionState::Ready);
        if let Some(interval) = self.rssi_interval {
            self.timers.arm_repeating(TimerKind::RssiTick, interval);
            // Signal strength is refreshed from advertisements, which the
            // adapter only reports while scanning.
            if let Err(e) = self.link.start_scan(&self.scan_filter()).await {
                warn!("Scanning for signal strength updates failed: {}", e);
            }
        }
    }

    fn resolve_handles(&self, services: &[GattService]) -> Result<GattHandles> {
        let service = services
            .iter()
            .find(|s| s.uuid == self.identity.service())
            .ok_or_else(|| {
                Error::ServiceDiscoveryFailed(format!(
                    "service {} not found among {} services",
                    self.identity.service(),
                    services.len()
                ))
            })?;
        let handle = |uuid: uuid::Uuid| {
            if service.characteristics.contains(&uuid) {
                Ok(CharacteristicHandle {
                    service: service.uuid,
                    characteristic: uuid,
                })
            } else {
                Err(Error::characteristic_not_found(
                    uuid.to_string(),
                    services.len(),
                ))
            }
        };
        Ok(GattHandles {
            write: handle(self.identity.write_characteristic())?,
            notify: handle(self.identity.notify_characteristic())?,
        })
    }

    async fn on_disconnected(&mut self, reason: Option<String>) {
        if !self.is_linking() && self.state() != ConnectionState::Ready {
            trace!(state = %self.state(), "Disconnect notice without a link, ignoring");
            return;
        }
        info!(reason = reason.as_deref().unwrap_or("unknown"), "Link lost");
        if self.state() == ConnectionState::Ready {
            self.stop_signal_scan().await;
        }
        if self.attempting_direct {
            self.direct_reconnect_failed = true;
        }
        self.handles = None;
        self.enter_disconnected();
        self.schedule_reconnect();
    }

    async fn on_adapter_powered(&mut self, on: bool) {
        if self.adapter_powered == on {
            return;
        }
        self.adapter_powered = on;
        if on {
            info!("Bluetooth adapter powered on");
            if self.started {
                self.start_scan().await;
            }
        } else {
            warn!("Bluetooth adapter powered off");
            self.teardown().await;
            if self.started {
                self.enter_disconnected();
            }
        }
    }

    async fn reconnect(&mut self) {
        if !self.started || !self.adapter_powered {
            return;
        }
        if self.bonded && !self.direct_reconnect_failed {
            info!("Reconnecting directly to bonded peripheral");
            self.attempting_direct = true;
            self.connect().await;
        } else {
            self.start_scan().await;
        }
    }

    async fn tick(&mut self) {
        if !self.started || !self.adapter_powered {
            return;
        }
        if !matches!(
            self.state(),
            ConnectionState::Idle | ConnectionState::Disconnected
        ) {
            return;
        }
        if self.timers.is_armed(TimerKind::ReconnectDelay)
            || self.timers.is_armed(TimerKind::ScanRetry)
        {
            return;
        }
        info!("Supervisor found nothing scheduled, retrying");
        self.reconnect().await;
    }

    /// Record a failure, tear the link down and schedule recovery.
    async fn fail(&mut self, error: Error) {
        let kind = error.kind();
        warn!(state = %self.state(), ?kind, "Link failure: {}", error);
        self.events.send(ControllerEvent::LinkFailure {
            kind,
            error: error.to_string(),
        });
        if self.attempting_direct {
            self.direct_reconnect_failed = true;
        }
        self.teardown().await;
        self.enter_disconnected();
        if kind == FailureKind::Scan {
            if self.adapter_powered {
                self.timers
                    .arm(TimerKind::ScanRetry, self.config.scan_retry_delay);
            }
        } else {
            self.schedule_reconnect();
        }
    }

    async fn teardown(&mut self) {
        match self.state() {
            ConnectionState::Scanning => {
                if let Err(e) = self.link.stop_scan().await {
                    debug!("Stopping scan during teardown failed: {}", e);
                }
            }
            ConnectionState::Ready => {
                self.stop_signal_scan().await;
                if let Err(e) = self.link.disconnect().await {
                    debug!("Disconnect during teardown failed: {}", e);
                }
            }
            ConnectionState::Connecting
            | ConnectionState::Bonding
            | ConnectionState::DiscoveringServices => {
                if let Err(e) = self.link.disconnect().await {
                    debug!("Disconnect during teardown failed: {}", e);
                }
            }
            ConnectionState::Idle | ConnectionState::Disconnected => {}
        }
        self.handles = None;
    }

    async fn stop_signal_scan(&mut self) {
        if self.rssi_interval.is_some()
            && let Err(e) = self.link.stop_scan().await
        {
            debug!("Stopping signal strength scan failed: {}", e);
        }
    }

    fn scan_filter(&self) -> ScanFilter {
        ScanFilter {
            address: self.identity.address(),
            service: self.identity.service(),
        }
    }

    fn enter_disconnected(&mut self) {
        self.timers.cancel_all_except(TimerKind::SupervisorTick);
        self.set_state(ConnectionState::Disconnected);
    }

    fn schedule_reconnect(&mut self) {
        if !self.adapter_powered {
            debug!("Adapter powered off, not scheduling reconnect");
            return;
        }
        debug!(delay = ?self.config.reconnect_delay, "Reconnect scheduled");
        self.timers
            .arm(TimerKind::ReconnectDelay, self.config.reconnect_delay);
    }

    fn set_state(&mut self, to: ConnectionState) {
        let from = self.state.send_replace(to);
        if from != to {
            info!(%from, %to, "Connection state changed");
            self.events
                .send(ControllerEvent::ConnectionStateChanged { from, to });
        }
    }

    fn is_linking(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connecting
                | ConnectionState::Bonding
                | ConnectionState::DiscoveringServices
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventReceiver;
    use crate::messages::{Input, InputReceiver, input_channel};
    use crate::mock::{LinkCall, MockLink};
    use keyfob_types::uuids::{COMMAND_WRITE, LOCK_SERVICE, STATUS_NOTIFY};

    struct Harness {
        link: Arc<MockLink>,
        sup: ConnectionSupervisor,
        inputs: InputReceiver,
        events: EventReceiver,
    }

    fn harness() -> Harness {
        let link = Arc::new(MockLink::new());
        let (tx, inputs) = input_channel();
        let dispatcher = EventDispatcher::new(256);
        let events = dispatcher.subscribe();
        let dyn_link: Arc<dyn PeripheralLink> = link.clone();
        let sup = ConnectionSupervisor::new(
            PeripheralIdentity::default(),
            SupervisorConfig::default(),
            dyn_link,
            tx,
            dispatcher,
        )
        .with_rssi_interval(Duration::from_secs(2));
        Harness {
            link,
            sup,
            inputs,
            events,
        }
    }

    fn lock_services() -> Vec<GattService> {
        vec![GattService::new(LOCK_SERVICE, [COMMAND_WRITE, STATUS_NOTIFY])]
    }

    fn discovered() -> LinkEvent {
        LinkEvent::Discovered {
            address: "5c:01:3b:96:dd:56".to_string(),
            rssi: Some(-60),
        }
    }

    fn transitions(rx: &mut EventReceiver) -> Vec<ConnectionState> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ControllerEvent::ConnectionStateChanged { to, .. } = event {
                out.push(to);
            }
        }
        out
    }

    /// Deliver timer expiries until one of `kind` has been handled.
    async fn run_timers_until(h: &mut Harness, kind: TimerKind) {
        loop {
            match h.inputs.recv().await {
                Some(Input::Timer(fired)) => {
                    if let Some(accepted) = h.sup.accept_timer(fired) {
                        h.sup.on_timer(accepted).await;
                        if accepted == kind {
                            return;
                        }
                    }
                }
                Some(_) => continue,
                None => panic!("input channel closed"),
            }
        }
    }

    async fn drive_to_ready(h: &mut Harness) {
        h.sup.start().await;
        h.sup.handle_link_event(discovered()).await;
        h.sup.handle_link_event(LinkEvent::Connected).await;
        if h.sup.state() == ConnectionState::Bonding {
            h.sup
                .handle_link_event(LinkEvent::BondStateChanged(BondState::Bonded))
                .await;
        }
        h.sup
            .handle_link_event(LinkEvent::ServicesDiscovered(lock_services()))
            .await;
        assert_eq!(h.sup.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_lifecycle_with_bonding() {
        let mut h = harness();
        drive_to_ready(&mut h).await;

        assert_eq!(
            transitions(&mut h.events),
            vec![
                ConnectionState::Scanning,
                ConnectionState::Connecting,
                ConnectionState::Bonding,
                ConnectionState::DiscoveringServices,
                ConnectionState::Ready,
            ]
        );
        assert!(h.sup.is_bonded());
        assert!(h.link.calls().contains(&LinkCall::Bond));
        assert!(h.link.calls().contains(&LinkCall::Subscribe(STATUS_NOTIFY)));
        let handles = h.sup.handles().copied().unwrap();
        assert_eq!(handles.write.characteristic, COMMAND_WRITE);
        assert!(!h.sup.is_timer_armed(TimerKind::ConnectTimeout));
        assert!(h.sup.is_timer_armed(TimerKind::RssiTick));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bonded_peripheral_skips_bonding() {
        let mut h = harness();
        h.link.set_bond_state(BondState::Bonded);
        drive_to_ready(&mut h).await;

        let seen = transitions(&mut h.events);
        assert!(!seen.contains(&ConnectionState::Bonding));
        assert!(!h.link.calls().contains(&LinkCall::Bond));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_link_keeps_scanning_for_signal_updates() {
        let mut h = harness();
        h.link.set_bond_state(BondState::Bonded);
        drive_to_ready(&mut h).await;

        let calls = h.link.calls();
        let subscribed = calls
            .iter()
            .position(|c| *c == LinkCall::Subscribe(STATUS_NOTIFY))
            .unwrap();
        assert_eq!(calls.last(), Some(&LinkCall::StartScan));
        assert!(calls.len() > subscribed + 1);

        // Advertisements seen while ready do not restart the link.
        h.sup.handle_link_event(discovered()).await;
        assert_eq!(h.sup.state(), ConnectionState::Ready);
        assert!(!h.link.calls()[subscribed..].iter().any(|c| matches!(c, LinkCall::Connect(_))));

        h.link.clear_calls();
        h.sup
            .handle_link_event(LinkEvent::Disconnected { reason: None })
            .await;
        assert_eq!(h.link.calls().first(), Some(&LinkCall::StopScan));
        assert_eq!(h.sup.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_devices_are_ignored() {
        let mut h = harness();
        h.sup.start().await;
        h.sup
            .handle_link_event(LinkEvent::Discovered {
                address: "AA:BB:CC:DD:EE:FF".to_string(),
                rssi: Some(-40),
            })
            .await;
        assert_eq!(h.sup.state(), ConnectionState::Scanning);
        assert!(!h.link.calls().iter().any(|c| matches!(c, LinkCall::Connect(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_characteristic_disconnects() {
        let mut h = harness();
        h.link.set_bond_state(BondState::Bonded);
        h.sup.start().await;
        h.sup.handle_link_event(discovered()).await;
        h.sup.handle_link_event(LinkEvent::Connected).await;
        h.sup
            .handle_link_event(LinkEvent::ServicesDiscovered(vec![GattService::new(
                LOCK_SERVICE,
                [COMMAND_WRITE],
            )]))
            .await;

        assert_eq!(h.sup.state(), ConnectionState::Disconnected);
        assert!(h.sup.handles().is_none());
        assert!(h.sup.is_timer_armed(TimerKind::ReconnectDelay));
        assert!(h.link.calls().contains(&LinkCall::Disconnect));

        let failure = std::iter::from_fn(|| h.events.try_recv().ok())
            .find_map(|e| match e {
                ControllerEvent::LinkFailure { kind, .. } => Some(kind),
                _ => None,
            });
        assert_eq!(failure, Some(FailureKind::ServiceDiscovery));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_failure_disconnects() {
        let mut h = harness();
        h.link.set_bond_state(BondState::Bonded);
        h.link.fail_subscribe(true);
        h.sup.start().await;
        h.sup.handle_link_event(discovered()).await;
        h.sup.handle_link_event(LinkEvent::Connected).await;
        h.sup
            .handle_link_event(LinkEvent::ServicesDiscovered(lock_services()))
            .await;
        assert_eq!(h.sup.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bond_rejection_disconnects() {
        let mut h = harness();
        h.sup.start().await;
        h.sup.handle_link_event(discovered()).await;
        h.sup.handle_link_event(LinkEvent::Connected).await;
        assert_eq!(h.sup.state(), ConnectionState::Bonding);

        h.sup
            .handle_link_event(LinkEvent::BondStateChanged(BondState::Unbonded))
            .await;
        assert_eq!(h.sup.state(), ConnectionState::Disconnected);
        assert!(h.sup.is_timer_armed(TimerKind::ReconnectDelay));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_failure_backs_off() {
        let mut h = harness();
        h.link.fail_scan(true);
        h.sup.start().await;

        assert_eq!(h.sup.state(), ConnectionState::Disconnected);
        assert!(h.sup.is_timer_armed(TimerKind::ScanRetry));
        assert!(!h.sup.is_timer_armed(TimerKind::ReconnectDelay));

        h.link.fail_scan(false);
        let before = tokio::time::Instant::now();
        run_timers_until(&mut h, TimerKind::ScanRetry).await;
        assert!(before.elapsed() >= Duration::from_secs(30));
        assert_eq!(h.sup.state(), ConnectionState::Scanning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let mut h = harness();
        h.sup.start().await;
        h.sup.handle_link_event(discovered()).await;
        assert_eq!(h.sup.state(), ConnectionState::Connecting);

        run_timers_until(&mut h, TimerKind::ConnectTimeout).await;
        assert_eq!(h.sup.state(), ConnectionState::Disconnected);
        assert!(h.link.calls().contains(&LinkCall::Disconnect));
        assert!(h.sup.is_timer_armed(TimerKind::ReconnectDelay));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_connect_completion_is_ignored() {
        let mut h = harness();
        h.sup.start().await;
        h.sup.handle_link_event(discovered()).await;
        run_timers_until(&mut h, TimerKind::ConnectTimeout).await;

        h.sup.handle_link_event(LinkEvent::Connected).await;
        assert_eq!(h.sup.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_reconnect_once_then_scan() {
        let mut h = harness();
        h.link.set_bond_state(BondState::Bonded);
        drive_to_ready(&mut h).await;
        transitions(&mut h.events);

        h.sup
            .handle_link_event(LinkEvent::Disconnected {
                reason: Some("out of range".into()),
            })
            .await;
        assert_eq!(h.sup.state(), ConnectionState::Disconnected);
        assert!(!h.sup.is_timer_armed(TimerKind::RssiTick));

        run_timers_until(&mut h, TimerKind::ReconnectDelay).await;
        assert_eq!(h.sup.state(), ConnectionState::Connecting);

        h.sup
            .handle_link_event(LinkEvent::ConnectFailed {
                reason: crate::error::ConnectionFailureReason::Rejected,
            })
            .await;
        assert_eq!(h.sup.state(), ConnectionState::Disconnected);

        run_timers_until(&mut h, TimerKind::ReconnectDelay).await;
        assert_eq!(h.sup.state(), ConnectionState::Scanning);
        assert_eq!(
            transitions(&mut h.events),
            vec![
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
                ConnectionState::Disconnected,
                ConnectionState::Scanning,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbonded_disconnect_rescans() {
        let mut h = harness();
        drive_to_ready(&mut h).await;
        h.sup
            .handle_link_event(LinkEvent::BondStateChanged(BondState::Unbonded))
            .await;
        assert_eq!(h.sup.state(), ConnectionState::Ready);

        h.sup
            .handle_link_event(LinkEvent::Disconnected { reason: None })
            .await;
        run_timers_until(&mut h, TimerKind::ReconnectDelay).await;
        assert_eq!(h.sup.state(), ConnectionState::Scanning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adapter_power_cycle() {
        let mut h = harness();
        drive_to_ready(&mut h).await;

        h.sup
            .handle_link_event(LinkEvent::AdapterPowered(false))
            .await;
        assert_eq!(h.sup.state(), ConnectionState::Disconnected);
        assert!(!h.sup.is_timer_armed(TimerKind::ReconnectDelay));
        assert!(!h.sup.is_timer_armed(TimerKind::ScanRetry));

        // The supervisory tick must not restart a powered-off adapter.
        run_timers_until(&mut h, TimerKind::SupervisorTick).await;
        assert_eq!(h.sup.state(), ConnectionState::Disconnected);

        h.sup.handle_link_event(LinkEvent::AdapterPowered(true)).await;
        assert_eq!(h.sup.state(), ConnectionState::Scanning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_tick_recovers_stall() {
        let mut h = harness();
        h.sup.start().await;
        h.sup.handle_link_event(discovered()).await;
        h.sup
            .handle_link_event(LinkEvent::Disconnected { reason: None })
            .await;
        assert_eq!(h.sup.state(), ConnectionState::Disconnected);

        // Simulate a lost retry timer.
        h.sup.timers.cancel(TimerKind::ReconnectDelay);
        run_timers_until(&mut h, TimerKind::SupervisorTick).await;
        assert_eq!(h.sup.state(), ConnectionState::Scanning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_notice_while_scanning_is_ignored() {
        let mut h = harness();
        h.sup.start().await;
        h.sup
            .handle_link_event(LinkEvent::Disconnected { reason: None })
            .await;
        assert_eq!(h.sup.state(), ConnectionState::Scanning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_and_shutdown_are_idempotent() {
        let mut h = harness();
        drive_to_ready(&mut h).await;

        h.sup.restart().await;
        assert_eq!(h.sup.state(), ConnectionState::Scanning);
        h.sup.restart().await;
        assert_eq!(h.sup.state(), ConnectionState::Scanning);

        h.sup.shutdown().await;
        assert_eq!(h.sup.state(), ConnectionState::Idle);
        h.sup.shutdown().await;
        assert_eq!(h.sup.state(), ConnectionState::Idle);
        assert!(!h.sup.is_timer_armed(TimerKind::SupervisorTick));

        h.sup.start().await;
        assert_eq!(h.sup.state(), ConnectionState::Scanning);
    }

    #[test]
    fn test_config_validation() {
        assert!(SupervisorConfig::default().validate().is_ok());
        assert!(
            SupervisorConfig::default()
                .connect_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(
            SupervisorConfig::default()
                .supervisor_tick(MAX_TIMER_PERIOD)
                .validate()
                .is_ok()
        );
        assert!(
            SupervisorConfig::default()
                .supervisor_tick(Duration::from_secs(u64::MAX))
                .validate()
                .is_err()
        );
    }
}
