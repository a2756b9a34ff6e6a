//! End-to-end scenarios for keyfob-core.
//!
//! These drive a running [`Controller`] through a responsive [`MockLink`]
//! with tokio's clock paused, so reconnect delays and RSSI sampling
//! intervals elapse instantly and deterministically.
//!
//! Run with: `cargo test --package keyfob-core --test scenarios`

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing_subscriber::EnvFilter;

use keyfob_core::{
    Address, Command, ConnectionState, Controller, ControllerConfig, ControllerEvent,
    ControllerHandle, EventReceiver, LinkEvent, LockState, MockLink, PeripheralIdentity,
    PeripheralLink, ProximityEvent, input_channel,
};

const PERIPHERAL: &str = "AA:BB:CC:DD:EE:FF";

/// Route controller logs through the test harness; set `RUST_LOG` to see them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Harness {
    link: Arc<MockLink>,
    handle: ControllerHandle,
    events: EventReceiver,
    task: JoinHandle<()>,
}

impl Harness {
    fn start() -> Self {
        let address: Address = PERIPHERAL.parse().unwrap();
        Self::with(PeripheralIdentity::new(address), ControllerConfig::default())
    }

    fn with(identity: PeripheralIdentity, config: ControllerConfig) -> Self {
        init_tracing();
        let (tx, rx) = input_channel();
        let link = Arc::new(MockLink::responsive(tx.clone()));
        let dyn_link: Arc<dyn PeripheralLink> = link.clone();
        let (controller, handle) = Controller::new(identity, config, dyn_link, tx, rx).unwrap();
        let events = handle.subscribe();
        let task = tokio::spawn(controller.run());
        Self {
            link,
            handle,
            events,
            task,
        }
    }

    /// Let the peripheral advertise and wait for the link to become ready.
    async fn advertise(&self, address: &str) {
        self.link.emit(LinkEvent::Discovered {
            address: address.to_string(),
            rssi: Some(-60),
        });
        self.wait_for(ConnectionState::Ready).await;
    }

    async fn wait_for(&self, state: ConnectionState) {
        let mut watch = self.handle.watch_connection();
        timeout(Duration::from_secs(60), watch.wait_for(|s| *s == state))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
            .map(|_| ())
            .unwrap();
    }

    fn drain(&mut self) -> Vec<ControllerEvent> {
        std::iter::from_fn(|| self.events.try_recv().ok()).collect()
    }
}

fn transitions(events: &[ControllerEvent]) -> Vec<ConnectionState> {
    events
        .iter()
        .filter_map(|e| match e {
            ControllerEvent::ConnectionStateChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_connects_through_every_state() {
    let mut harness = Harness::start();

    // Other devices are ignored; address matching is case-insensitive.
    harness.link.emit(LinkEvent::Discovered {
        address: "11:22:33:44:55:66".to_string(),
        rssi: Some(-50),
    });
    harness.advertise("aa:bb:cc:dd:ee:ff").await;

    assert_eq!(
        transitions(&harness.drain()),
        vec![
            ConnectionState::Scanning,
            ConnectionState::Connecting,
            ConnectionState::Bonding,
            ConnectionState::DiscoveringServices,
            ConnectionState::Ready,
        ]
    );
    let address: Address = PERIPHERAL.parse().unwrap();
    assert!(
        harness
            .link
            .calls()
            .contains(&keyfob_core::LinkCall::Connect(address))
    );
}

#[tokio::test(start_paused = true)]
async fn test_median_ignores_spike_and_unlocks_once() {
    let mut harness = Harness::start();
    harness.advertise(PERIPHERAL).await;

    harness.link.notify("Locked");
    harness.link.push_rssi([-70, -72, -69, -95, -71]);
    sleep(Duration::from_secs(30)).await;

    assert_eq!(harness.link.written(), vec!["UNLOCK"]);
    assert_eq!(harness.handle.lock_state().state, LockState::Unlocked);

    let events = harness.drain();
    let first_smoothed = events.iter().find_map(|e| match e {
        ControllerEvent::RssiSampled {
            smoothed: Some(smoothed),
            ..
        } => Some(*smoothed),
        _ => None,
    });
    assert_eq!(first_smoothed, Some(-71));
    let near: Vec<_> = events
        .iter()
        .filter(|e| {
            matches!(
                e,
                ControllerEvent::Proximity {
                    event: ProximityEvent::Near,
                    ..
                }
            )
        })
        .collect();
    assert_eq!(near.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_manual_lock_holds_until_manual_unlock() {
    let harness = Harness::start();
    harness.advertise(PERIPHERAL).await;

    harness.handle.lock().await.unwrap();
    harness.link.set_rssi(-55);
    sleep(Duration::from_secs(30)).await;

    assert_eq!(harness.link.written(), vec!["LOCK"]);
    let snapshot = harness.handle.lock_state();
    assert_eq!(snapshot.state, LockState::Locked);
    assert!(snapshot.manual_override);

    harness.handle.unlock().await.unwrap();
    sleep(Duration::from_secs(1)).await;
    assert_eq!(harness.link.written(), vec!["LOCK", "UNLOCK"]);
    assert!(!harness.handle.lock_state().manual_override);
}

#[tokio::test(start_paused = true)]
async fn test_manual_lock_released_by_disconnect() {
    let harness = Harness::start();
    harness.advertise(PERIPHERAL).await;

    harness.handle.lock().await.unwrap();
    harness.link.set_rssi(-55);
    sleep(Duration::from_secs(10)).await;
    assert_eq!(harness.link.written(), vec!["LOCK"]);

    harness.link.drop_link("out of range");
    harness.wait_for(ConnectionState::Disconnected).await;
    let snapshot = harness.handle.lock_state();
    assert_eq!(snapshot.state, LockState::Unknown);
    assert!(!snapshot.manual_override);

    // The bonded peripheral is reconnected directly after the reconnect delay,
    // and the strong signal now unlocks.
    harness.wait_for(ConnectionState::Ready).await;
    sleep(Duration::from_secs(30)).await;
    assert_eq!(harness.link.written(), vec!["LOCK", "UNLOCK"]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_write_does_not_block_queue() {
    let mut harness = Harness::start();
    harness.advertise(PERIPHERAL).await;
    harness.link.fail_writes_of(Command::Lock);

    harness.handle.lock().await.unwrap();
    harness.handle.locate().await.unwrap();
    sleep(Duration::from_secs(1)).await;

    assert_eq!(harness.link.written(), vec!["LOCK", "LOCATE"]);
    let events = harness.drain();
    assert!(events.iter().any(|e| matches!(
        e,
        ControllerEvent::CommandFailed {
            command: Command::Lock,
            ..
        }
    )));
    assert!(events.contains(&ControllerEvent::CommandSent {
        command: Command::Locate
    }));
    assert_eq!(harness.handle.connection_state(), ConnectionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_commands_written_in_order_one_at_a_time() {
    let harness = Harness::start();
    harness.advertise(PERIPHERAL).await;
    harness.link.set_write_latency(Duration::from_millis(200));

    harness.handle.lock().await.unwrap();
    harness.handle.trunk().await.unwrap();
    harness.handle.locate().await.unwrap();
    harness.handle.unlock().await.unwrap();
    sleep(Duration::from_secs(2)).await;

    assert_eq!(
        harness.link.written(),
        vec!["LOCK", "TRUNK", "LOCATE", "UNLOCK"]
    );
    assert_eq!(harness.link.max_concurrent_writes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_walking_away_locks() {
    let harness = Harness::start();
    harness.advertise(PERIPHERAL).await;

    harness.link.set_rssi(-60);
    sleep(Duration::from_secs(12)).await;
    assert_eq!(harness.handle.lock_state().state, LockState::Unlocked);

    harness.link.set_rssi(-100);
    sleep(Duration::from_secs(12)).await;
    assert_eq!(harness.link.written(), vec!["UNLOCK", "LOCK"]);
    let snapshot = harness.handle.lock_state();
    assert_eq!(snapshot.state, LockState::Locked);
    assert!(!snapshot.manual_override);
}

#[tokio::test(start_paused = true)]
async fn test_auto_mode_off_ignores_proximity() {
    let harness = Harness::start();
    harness.advertise(PERIPHERAL).await;

    harness.handle.set_auto_mode(false).unwrap();
    harness.link.set_rssi(-55);
    sleep(Duration::from_secs(20)).await;
    assert!(harness.link.written().is_empty());
    assert!(!harness.handle.lock_state().auto_mode);

    // Manual commands still work.
    harness.handle.trunk().await.unwrap();
    sleep(Duration::from_secs(1)).await;
    assert_eq!(harness.link.written(), vec!["TRUNK"]);
}

#[tokio::test(start_paused = true)]
async fn test_commands_rejected_while_scanning() {
    let mut harness = Harness::start();
    harness.wait_for(ConnectionState::Scanning).await;

    let result = harness.handle.lock().await;
    assert!(matches!(
        result,
        Err(keyfob_core::Error::NotReady(Command::Lock))
    ));
    assert_eq!(harness.handle.lock_state().state, LockState::Unknown);
    assert!(harness.drain().iter().any(|e| matches!(
        e,
        ControllerEvent::CommandDropped {
            command: Command::Lock,
            ..
        }
    )));
}

#[tokio::test(start_paused = true)]
async fn test_adapter_power_cycle() {
    let harness = Harness::start();
    harness.advertise(PERIPHERAL).await;

    harness.link.emit(LinkEvent::AdapterPowered(false));
    harness.wait_for(ConnectionState::Disconnected).await;

    // Parked: no retries while the radio is off.
    sleep(Duration::from_secs(60)).await;
    assert_eq!(
        harness.handle.connection_state(),
        ConnectionState::Disconnected
    );

    harness.link.emit(LinkEvent::AdapterPowered(true));
    harness.wait_for(ConnectionState::Scanning).await;
}

#[tokio::test(start_paused = true)]
async fn test_unbonded_peripheral_rejecting_pairing_retries() {
    let mut harness = Harness::start();
    harness
        .link
        .set_bond_result(keyfob_core::BondState::Unbonded);
    harness.link.emit(LinkEvent::Discovered {
        address: PERIPHERAL.to_string(),
        rssi: None,
    });
    harness.wait_for(ConnectionState::Disconnected).await;

    let events = harness.drain();
    assert!(events.iter().any(|e| matches!(
        e,
        ControllerEvent::LinkFailure {
            kind: keyfob_core::FailureKind::Bond,
            ..
        }
    )));

    // Never bonded, so the retry scans rather than connecting directly.
    harness.wait_for(ConnectionState::Scanning).await;
}

#[tokio::test(start_paused = true)]
async fn test_restart_and_shutdown() {
    let harness = Harness::start();
    harness.advertise(PERIPHERAL).await;

    harness.handle.restart().unwrap();
    harness.wait_for(ConnectionState::Scanning).await;
    harness.advertise(PERIPHERAL).await;

    harness.handle.shutdown();
    timeout(Duration::from_secs(5), harness.task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(harness.handle.connection_state(), ConnectionState::Idle);

    // Stopping a stopped controller is harmless.
    harness.handle.shutdown();
    assert!(harness.handle.set_auto_mode(true).is_err());
}
