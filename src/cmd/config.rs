//! Configuration view and validation commands — `deckhand config`.

use std::path::Path;

use anyhow::Result;

use super::super::ConfigCommands;
use deckhand::config::PanelConfig;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let mut config = PanelConfig::load_or_default(config_path)?;
            config.apply_env();

            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No config file at {}; showing defaults", config_path.display());
            }
            println!("# Effective values (with environment overrides)");
            println!();
            print!("{}", config.to_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            if !config_path.exists() {
                println!("No {} found. Using defaults (valid).", config_path.display());
                return Ok(());
            }

            let config = PanelConfig::load(config_path)?;
            let errors = config.validate();
            if errors.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration errors:");
                for error in &errors {
                    println!("  - {}", error);
                }
                anyhow::bail!("{} configuration error(s)", errors.len());
            }
        }
        Some(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                println!("{} already exists.", config_path.display());
                println!("Pass --force to overwrite it.");
                return Ok(());
            }

            if let Some(parent) = config_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            PanelConfig::default().save(config_path)?;

            println!("Created {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] host, port, public_dir, permissive_cors");
            println!("  - [workspace] root, staging_dir");
            println!("  - [process] run_command, install_command, noise_patterns");
            println!("  - [logs] capacity");
        }
    }

    Ok(())
}
