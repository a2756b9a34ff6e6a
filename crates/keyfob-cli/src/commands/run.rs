//! Run command implementation.
//!
//! Starts the controller on the first Bluetooth adapter, prints its events
//! and reads console commands from stdin. Runs until `quit` or Ctrl-C; when
//! stdin is closed the controller keeps running until interrupted.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use keyfob_core::{BtleplugLink, Controller, ControllerHandle, EventReceiver, input_channel};

use crate::config::Config;
use crate::console::{ConsoleCommand, HELP};
use crate::format::{FormatOptions, format_event, format_status};

/// Arguments for the run command.
pub struct RunArgs<'a> {
    pub config: Option<&'a Path>,
    pub address: Option<String>,
    pub manual: bool,
    pub verbose: bool,
    pub quiet: bool,
    pub opts: FormatOptions,
}

pub async fn cmd_run(args: RunArgs<'_>) -> Result<()> {
    let RunArgs {
        config,
        address,
        manual,
        verbose,
        quiet,
        opts,
    } = args;

    let config = match address {
        Some(address) => {
            let mut config =
                Config::load_from(config).context("Failed to load configuration")?;
            config.peripheral.address = address;
            config.validate().context("Invalid configuration")?;
            config
        }
        None => Config::load_validated(config).context("Invalid configuration")?,
    };
    let identity = config.identity()?;
    let mut controller_config = config.controller_config()?;
    if manual {
        controller_config.auto_mode = false;
    }

    let (tx, rx) = input_channel();
    let link = BtleplugLink::new(tx.clone())
        .await
        .context("No usable Bluetooth adapter")?
        .with_rssi_max_age(controller_config.proximity.sample_interval);
    let address = identity.address();
    let (controller, handle) =
        Controller::new(identity, controller_config, Arc::new(link), tx, rx)?;

    if !quiet {
        eprintln!(
            "Looking for vehicle {} (type 'help' for commands)",
            address.to_string().cyan()
        );
    }

    let printer = tokio::spawn(print_events(handle.subscribe(), opts, verbose));
    let controller_task = tokio::spawn(controller.run());

    console(&handle, &opts).await?;

    handle.shutdown();
    controller_task.await.context("Controller task failed")?;
    printer.abort();
    Ok(())
}

async fn console(handle: &ControllerHandle, opts: &FormatOptions) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    debug!("stdin closed, running until interrupted");
                    stdin_open = false;
                    continue;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<ConsoleCommand>() {
                    Ok(ConsoleCommand::Quit) => return Ok(()),
                    Ok(command) => execute(handle, command, opts).await,
                    Err(e) => eprintln!("{}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!();
                return Ok(());
            }
        }
    }
}

async fn execute(handle: &ControllerHandle, command: ConsoleCommand, opts: &FormatOptions) {
    let result = match command {
        ConsoleCommand::Send(command) => handle.send(command).await,
        ConsoleCommand::Auto(enabled) => handle.set_auto_mode(enabled),
        ConsoleCommand::Restart => handle.restart(),
        ConsoleCommand::Status => {
            print!(
                "{}",
                format_status(handle.connection_state(), &handle.lock_state(), opts)
            );
            Ok(())
        }
        ConsoleCommand::Help => {
            println!("{}", HELP);
            Ok(())
        }
        ConsoleCommand::Quit => Ok(()),
    };
    if let Err(e) = result {
        if opts.no_color {
            eprintln!("Error: {}", e);
        } else {
            eprintln!("{} {}", "Error:".red(), e);
        }
    }
}

async fn print_events(mut events: EventReceiver, opts: FormatOptions, verbose: bool) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Some(line) = format_event(&event, &opts, verbose) {
                    println!("{}", line);
                }
            }
            Err(RecvError::Lagged(missed)) => warn!("Missed {} events", missed),
            Err(RecvError::Closed) => break,
        }
    }
}
