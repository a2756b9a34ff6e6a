//! CLI argument definitions using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "keyfob")]
#[command(author, version, about = "Keyless entry for a BLE vehicle lock", long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true, env = "KEYFOB_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Connect to the vehicle and keep it locked or unlocked by proximity
    Run {
        /// Peripheral address, overriding the configuration file
        #[arg(short, long, env = "KEYFOB_ADDRESS")]
        address: Option<String>,

        /// Start with proximity control disabled
        #[arg(long)]
        manual: bool,

        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Write a configuration file with default values
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
    /// Print the configuration file path
    Path,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_with_address() {
        let cli = Cli::try_parse_from(["keyfob", "run", "--address", "AA:BB:CC:DD:EE:FF"]).unwrap();
        match cli.command {
            Commands::Run {
                address, manual, ..
            } => {
                assert_eq!(address.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
                assert!(!manual);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_config_init_force() {
        let cli = Cli::try_parse_from(["keyfob", "-q", "config", "init", "--force"]).unwrap();
        assert!(cli.quiet);
        assert!(matches!(
            cli.command,
            Commands::Config {
                action: ConfigAction::Init { force: true }
            }
        ));
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["keyfob"]).is_err());
    }
}
