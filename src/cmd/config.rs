//! Configuration view and validation commands: `slipway config`.

use anyhow::Result;
use std::path::{Path, PathBuf};

use slipway::config::{CONFIG_FILE_NAME, Config, SlipwayToml};

use super::super::ConfigCommands;

const REDACTED: &str = "<redacted>";

/// Settings with credentials masked, for display.
fn redacted(settings: &SlipwayToml) -> SlipwayToml {
    let mut shown = settings.clone();
    for secret in [
        &mut shown.storage.swift.auth_token,
        &mut shown.storage.swift.temp_url_key,
        &mut shown.deployer.auth_token,
    ] {
        if secret.is_some() {
            *secret = Some(REDACTED.to_string());
        }
    }
    shown
}

pub fn cmd_config(explicit: Option<&Path>, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let config = Config::load(explicit)?;
            match &config.source {
                Some(path) => println!("# Config file: {}", path.display()),
                None => println!("# No slipway.toml found, using defaults"),
            }
            println!();
            print!("{}", toml::to_string_pretty(&redacted(&config.settings))?);
        }
        Some(ConfigCommands::Validate) => {
            let config = Config::load(explicit)?;
            if config.source.is_none() {
                println!("No slipway.toml found. Checking defaults.");
            }
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init) => {
            let path = explicit
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
            if path.exists() {
                println!("{} already exists.", path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            SlipwayToml::default().save(&path)?;
            println!("Created {}", path.display());
        }
    }
    Ok(())
}
