use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use keyfob_cli::cli::{Cli, Commands};
use keyfob_cli::commands::{RunArgs, cmd_config, cmd_run};
use keyfob_cli::format::FormatOptions;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Events go to stdout, so logs go to stderr
    let filter = if cli.quiet {
        EnvFilter::new("error")
    } else if cli.verbose {
        EnvFilter::new("keyfob_core=debug,keyfob_cli=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            address,
            manual,
            json,
        } => {
            cmd_run(RunArgs {
                config: cli.config.as_deref(),
                address,
                manual,
                verbose: cli.verbose,
                quiet: cli.quiet,
                opts: FormatOptions::new(cli.no_color, json),
            })
            .await
        }
        Commands::Config { action } => cmd_config(action, cli.config.as_deref(), cli.quiet),
    }
}
