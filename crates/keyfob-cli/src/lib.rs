//! Command-line interface for a BLE vehicle lock.
//!
//! The `keyfob` binary keeps a bonded link to the vehicle's lock peripheral,
//! unlocks as you approach and locks as you walk away, and accepts manual
//! commands on stdin.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `run` | Connect and control the vehicle |
//! | `config init` | Write a default configuration file |
//! | `config show` | Print the effective configuration |
//! | `config path` | Print the configuration file path |
//!
//! While `run` is active, type `lock`, `unlock`, `trunk`, `locate`,
//! `auto on`, `auto off`, `restart`, `status` or `quit`.
//!
//! # Configuration
//!
//! The CLI reads `~/.config/keyfob/config.toml` (or platform equivalent).
//! See [`config`] for the sections and keys.
//!
//! # Environment Variables
//!
//! - `KEYFOB_CONFIG`: Configuration file (overridden by `--config`)
//! - `KEYFOB_ADDRESS`: Peripheral address (overridden by `--address`)
//! - `RUST_LOG`: Log filter
//! - `NO_COLOR`: Disable colored output when set
//!
//! # Examples
//!
//! ```bash
//! keyfob config init
//! keyfob run --address 5C:01:3B:96:DD:56
//! keyfob run --manual --json
//! ```

pub mod cli;
pub mod commands;
pub mod config;
pub mod console;
pub mod format;

// Re-export core dependencies for convenience
pub use keyfob_core;
pub use keyfob_types;
