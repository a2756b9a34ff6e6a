//! Interactive commands typed on stdin while the controller runs.

use std::fmt;
use std::str::FromStr;

use keyfob_types::Command;

/// Help text listing the console commands.
pub const HELP: &str = "\
Commands:
  lock | unlock | trunk | locate   send a command to the vehicle
  auto on | auto off               enable or disable proximity control
  restart                          drop the link and scan again
  status                           show connection and lock state
  help                             show this help
  quit                             disconnect and exit";

/// One line of console input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    Send(Command),
    Auto(bool),
    Restart,
    Status,
    Help,
    Quit,
}

/// Unrecognised console input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown command '{0}' (type 'help')")]
pub struct UnknownInput(pub String);

impl FromStr for ConsoleCommand {
    type Err = UnknownInput;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.trim().to_ascii_lowercase();
        let mut words = line.split_whitespace();
        let parsed = match (words.next(), words.next(), words.next()) {
            (Some("auto"), Some("on"), None) => Self::Auto(true),
            (Some("auto"), Some("off"), None) => Self::Auto(false),
            (Some("restart"), None, None) => Self::Restart,
            (Some("status"), None, None) => Self::Status,
            (Some("help" | "?"), None, None) => Self::Help,
            (Some("quit" | "exit"), None, None) => Self::Quit,
            (Some(word), None, None) => word
                .parse::<Command>()
                .map(Self::Send)
                .map_err(|_| UnknownInput(s.trim().to_string()))?,
            _ => return Err(UnknownInput(s.trim().to_string())),
        };
        Ok(parsed)
    }
}

impl fmt::Display for ConsoleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send(command) => write!(f, "{}", command.to_string().to_lowercase()),
            Self::Auto(true) => write!(f, "auto on"),
            Self::Auto(false) => write!(f, "auto off"),
            Self::Restart => write!(f, "restart"),
            Self::Status => write!(f, "status"),
            Self::Help => write!(f, "help"),
            Self::Quit => write!(f, "quit"),
        }
    }
}
