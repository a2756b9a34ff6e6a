//! Config command implementation.

use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::cli::ConfigAction;
use crate::config::{Config, default_config_path};

pub fn cmd_config(action: ConfigAction, path: Option<&Path>, quiet: bool) -> Result<()> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    match action {
        ConfigAction::Path => println!("{}", path.display()),
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            Config::default().save(&path)?;
            if !quiet {
                eprintln!("Wrote default configuration to {}", path.display());
            }
        }
        ConfigAction::Show => {
            let config = if path.exists() {
                Config::load(&path)?
            } else {
                Config::default()
            };
            let content =
                toml::to_string_pretty(&config).context("Failed to serialize config")?;
            print!("{}", content);
            if let Err(e) = config.validate() {
                eprintln!("Warning: {}", e);
            }
        }
    }
    Ok(())
}
