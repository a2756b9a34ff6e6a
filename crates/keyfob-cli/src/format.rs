//! Output formatting for controller events and status.

use owo_colors::OwoColorize;

use keyfob_core::{ControllerEvent, LockSnapshot};
use keyfob_types::{ConnectionState, LockState, ProximityEvent};

/// Formatting options for output.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatOptions {
    /// Disable colored output.
    pub no_color: bool,
    /// Emit one JSON object per line instead of text.
    pub json: bool,
}

impl FormatOptions {
    pub fn new(no_color: bool, json: bool) -> Self {
        Self { no_color, json }
    }

    /// Apply color to a string if colors are enabled.
    fn paint(&self, text: &str, color: Color) -> String {
        if self.no_color {
            return text.to_string();
        }
        match color {
            Color::Green => text.green().to_string(),
            Color::Yellow => text.yellow().to_string(),
            Color::Red => text.red().to_string(),
            Color::Cyan => text.cyan().to_string(),
            Color::Dimmed => text.dimmed().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Color {
    Green,
    Yellow,
    Red,
    Cyan,
    Dimmed,
}

fn connection_color(state: ConnectionState) -> Color {
    match state {
        ConnectionState::Ready => Color::Green,
        ConnectionState::Disconnected => Color::Red,
        ConnectionState::Idle => Color::Dimmed,
        _ => Color::Yellow,
    }
}

fn lock_color(state: LockState) -> Color {
    match state {
        LockState::Locked => Color::Green,
        LockState::Unlocked => Color::Yellow,
        LockState::Unknown => Color::Dimmed,
    }
}

/// Format one event as a single line, or `None` if it is too chatty to
/// print (RSSI samples are shown only when `verbose`).
pub fn format_event(event: &ControllerEvent, opts: &FormatOptions, verbose: bool) -> Option<String> {
    if matches!(event, ControllerEvent::RssiSampled { .. }) && !verbose {
        return None;
    }
    if opts.json {
        return serde_json::to_string(event).ok();
    }

    let line = match event {
        ControllerEvent::ConnectionStateChanged { to, .. } => format!(
            "Connection: {}",
            opts.paint(&to.to_string(), connection_color(*to))
        ),
        ControllerEvent::LockStateChanged {
            state,
            manual_override,
        } => {
            let mut line = format!("Vehicle: {}", opts.paint(&state.to_string(), lock_color(*state)));
            if *manual_override {
                line.push_str(" (held by manual lock)");
            }
            line
        }
        ControllerEvent::AutoModeChanged { enabled } => {
            format!(
                "Proximity control: {}",
                if *enabled { "on" } else { "off" }
            )
        }
        ControllerEvent::RssiSampled { rssi, smoothed } => match smoothed {
            Some(smoothed) => format!("RSSI: {} dBm (median {} dBm)", rssi, smoothed),
            None => format!("RSSI: {} dBm", rssi),
        },
        ControllerEvent::Proximity { event, smoothed } => {
            let color = match event {
                ProximityEvent::Near => Color::Cyan,
                ProximityEvent::Far => Color::Dimmed,
            };
            format!(
                "Proximity: {} ({} dBm)",
                opts.paint(&event.to_string(), color),
                smoothed
            )
        }
        ControllerEvent::Notification { notification } => {
            format!("Vehicle says: {}", notification)
        }
        ControllerEvent::CommandSent { command } => format!("Sent {}", command),
        ControllerEvent::CommandFailed { command, error } => format!(
            "{} {}: {}",
            opts.paint("Failed to send", Color::Red),
            command,
            error
        ),
        ControllerEvent::CommandDropped { command, reason } => {
            format!("Dropped {}: {}", command, reason)
        }
        ControllerEvent::LinkFailure { kind, error } => format!(
            "{} ({:?}): {}",
            opts.paint("Link failure", Color::Red),
            kind,
            error
        ),
        other => format!("{:?}", other),
    };
    Some(line)
}

/// Format the `status` console command's output.
pub fn format_status(
    connection: ConnectionState,
    lock: &LockSnapshot,
    opts: &FormatOptions,
) -> String {
    if opts.json {
        let value = serde_json::json!({
            "connection": connection,
            "lock": lock,
        });
        return value.to_string();
    }

    let mut out = String::new();
    out.push_str(&format!(
        "Connection:        {}\n",
        opts.paint(&connection.to_string(), connection_color(connection))
    ));
    out.push_str(&format!(
        "Vehicle:           {}\n",
        opts.paint(&lock.state.to_string(), lock_color(lock.state))
    ));
    out.push_str(&format!(
        "Manual lock:       {}\n",
        if lock.manual_override { "held" } else { "no" }
    ));
    out.push_str(&format!(
        "Proximity control: {}\n",
        if lock.auto_mode { "on" } else { "off" }
    ));
    if let Some(text) = &lock.last_notification {
        out.push_str(&format!("Last status:       {}\n", text));
    }
    out
}
