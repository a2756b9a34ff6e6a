//! Command implementations for the CLI.

mod config;
mod run;

pub use config::cmd_config;
pub use run::{RunArgs, cmd_run};
