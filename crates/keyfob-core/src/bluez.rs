//! BlueZ pairing over D-Bus.
//!
//! btleplug has no pairing API, so on Linux the bond state is read from and
//! pairing is requested through BlueZ's `org.bluez.Device1` interface.
//!
//! While pairing, an `org.bluez.Agent1` object is served on the same bus
//! connection that calls `Pair()`. BlueZ routes passkey and PIN requests to
//! the agent of the caller, so the configured [`PairingSecret`] is what the
//! peripheral receives. The agent is unregistered once pairing completes.

use std::sync::Arc;
use std::time::Duration;

use dbus::Path;
use dbus::channel::MatchingReceiver;
use dbus::message::MatchRule;
use dbus::nonblock::stdintf::org_freedesktop_dbus::Properties;
use dbus::nonblock::{Proxy, SyncConnection};
use dbus_crossroads::{Crossroads, IfaceBuilder, MethodErr};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use keyfob_types::{Address, PairingSecret};

use crate::error::{Error, Result};

const BLUEZ: &str = "org.bluez";
const BLUEZ_ROOT: &str = "/org/bluez";
const DEVICE_INTERFACE: &str = "org.bluez.Device1";
const AGENT_INTERFACE: &str = "org.bluez.Agent1";
const AGENT_MANAGER_INTERFACE: &str = "org.bluez.AgentManager1";
const AGENT_PATH: &str = "/org/keyfob/agent";
const AGENT_CAPABILITY: &str = "KeyboardDisplay";
const ALREADY_EXISTS: &str = "org.bluez.Error.AlreadyExists";
const REJECTED: &str = "org.bluez.Error.Rejected";
const CALL_TIMEOUT: Duration = Duration::from_secs(5);
const PAIR_TIMEOUT: Duration = Duration::from_secs(30);

/// D-Bus object path of a device under an adapter, e.g.
/// `/org/bluez/hci0/dev_5C_01_3B_96_DD_56`.
pub fn device_path(adapter: &str, address: Address) -> String {
    format!(
        "/org/bluez/{}/dev_{}",
        adapter,
        address.to_string().replace(':', "_")
    )
}

/// Whether BlueZ holds a bond for the device.
pub async fn is_paired(adapter: String, address: Address) -> Result<bool> {
    let path = object_path(&adapter, address)?;
    let bus = SystemBus::connect()?;
    bus.proxy(path, CALL_TIMEOUT)
        .get::<bool>(DEVICE_INTERFACE, "Paired")
        .await
        .map_err(bond_error)
}

/// Ask BlueZ to pair with the device, answering its passkey and PIN
/// requests with `secret`. Resolves once pairing completed.
pub async fn pair(adapter: String, address: Address, secret: PairingSecret) -> Result<()> {
    let device = object_path(&adapter, address)?;
    let agent = object_path_from(AGENT_PATH)?;
    let bus = SystemBus::connect()?;

    let mut cr = Crossroads::new();
    let iface = register_agent(&mut cr);
    cr.insert(agent.clone(), &[iface], AgentReplies::new(secret));
    let receiver = bus.conn.start_receive(
        MatchRule::new_method_call(),
        Box::new(move |msg, conn| {
            if cr.handle_message(msg, conn).is_err() {
                debug!("Agent could not answer a D-Bus call");
            }
            true
        }),
    );

    let manager = bus.proxy(object_path_from(BLUEZ_ROOT)?, CALL_TIMEOUT);
    manager
        .method_call::<(), _, _, _>(
            AGENT_MANAGER_INTERFACE,
            "RegisterAgent",
            (agent.clone(), AGENT_CAPABILITY),
        )
        .await
        .map_err(bond_error)?;
    debug!(path = AGENT_PATH, "Pairing agent registered");

    let outcome = match bus
        .proxy(device, PAIR_TIMEOUT)
        .method_call::<(), _, _, _>(DEVICE_INTERFACE, "Pair", ())
        .await
    {
        Ok(()) => {
            info!("Pairing completed");
            Ok(())
        }
        Err(e) if e.name() == Some(ALREADY_EXISTS) => {
            debug!("Device already paired");
            Ok(())
        }
        Err(e) => Err(bond_error(e)),
    };

    if let Err(e) = manager
        .method_call::<(), _, _, _>(AGENT_MANAGER_INTERFACE, "UnregisterAgent", (agent,))
        .await
    {
        warn!("Unregistering pairing agent failed: {}", e);
    }
    bus.conn.stop_receive(receiver);
    outcome
}

/// Answers BlueZ agent requests from the configured secret.
#[derive(Debug, Clone)]
struct AgentReplies {
    secret: PairingSecret,
}

impl AgentReplies {
    fn new(secret: PairingSecret) -> Self {
        Self { secret }
    }

    /// Reply to `RequestPinCode`: the PIN as entered.
    fn pin_code(&self) -> String {
        self.secret.as_str().to_string()
    }

    /// Reply to `RequestPasskey`, when the PIN is a valid passkey.
    fn passkey(&self) -> Option<u32> {
        self.secret.as_passkey()
    }

    /// Whether a passkey shown for confirmation is ours.
    fn confirms(&self, passkey: u32) -> bool {
        self.passkey() == Some(passkey)
    }
}

fn rejected(message: &str) -> MethodErr {
    MethodErr::from((REJECTED, message))
}

fn register_agent(cr: &mut Crossroads) -> dbus_crossroads::IfaceToken<AgentReplies> {
    cr.register(AGENT_INTERFACE, |b: &mut IfaceBuilder<AgentReplies>| {
        b.method("Release", (), (), |_, _, (): ()| {
            debug!("Pairing agent released");
            Ok(())
        });
        b.method(
            "RequestPinCode",
            ("device",),
            ("pincode",),
            |_, agent, (device,): (Path<'static>,)| {
                debug!(%device, "Supplying PIN code");
                Ok((agent.pin_code(),))
            },
        );
        b.method(
            "DisplayPinCode",
            ("device", "pincode"),
            (),
            |_, _, (device, _pin): (Path<'static>, String)| {
                debug!(%device, "Peripheral displays a PIN code");
                Ok(())
            },
        );
        b.method(
            "RequestPasskey",
            ("device",),
            ("passkey",),
            |_, agent, (device,): (Path<'static>,)| {
                debug!(%device, "Supplying passkey");
                agent
                    .passkey()
                    .map(|passkey| (passkey,))
                    .ok_or_else(|| rejected("configured PIN is not a six-digit passkey"))
            },
        );
        b.method(
            "DisplayPasskey",
            ("device", "passkey", "entered"),
            (),
            |_, _, (_device, _passkey, _entered): (Path<'static>, u32, u16)| Ok(()),
        );
        b.method(
            "RequestConfirmation",
            ("device", "passkey"),
            (),
            |_, agent, (device, passkey): (Path<'static>, u32)| {
                if agent.confirms(passkey) {
                    Ok(())
                } else {
                    warn!(%device, "Passkey shown by peripheral does not match the PIN");
                    Err(rejected("passkey does not match the configured PIN"))
                }
            },
        );
        b.method(
            "RequestAuthorization",
            ("device",),
            (),
            |_, _, (_device,): (Path<'static>,)| Ok(()),
        );
        b.method(
            "AuthorizeService",
            ("device", "uuid"),
            (),
            |_, _, (_device, _uuid): (Path<'static>, String)| Ok(()),
        );
        b.method("Cancel", (), (), |_, _, (): ()| {
            debug!("Pairing cancelled by BlueZ");
            Ok(())
        });
    })
}

/// A system bus connection whose I/O runs on a Tokio task.
struct SystemBus {
    conn: Arc<SyncConnection>,
    io: JoinHandle<()>,
}

impl SystemBus {
    fn connect() -> Result<Self> {
        let (resource, conn) = dbus_tokio::connection::new_system_sync().map_err(bond_error)?;
        let io = tokio::spawn(async move {
            let err = resource.await;
            debug!("D-Bus connection closed: {}", err);
        });
        Ok(Self { conn, io })
    }

    fn proxy(&self, path: Path<'static>, timeout: Duration) -> Proxy<'static, Arc<SyncConnection>> {
        Proxy::new(BLUEZ, path, timeout, Arc::clone(&self.conn))
    }
}

impl Drop for SystemBus {
    fn drop(&mut self) {
        self.io.abort();
    }
}

fn object_path(adapter: &str, address: Address) -> Result<Path<'static>> {
    object_path_from(&device_path(adapter, address))
}

fn object_path_from(path: &str) -> Result<Path<'static>> {
    Path::new(path.to_string()).map_err(Error::BondFailed)
}

fn bond_error(e: dbus::Error) -> Error {
    Error::BondFailed(e.message().unwrap_or("D-Bus call failed").to_string())
}
