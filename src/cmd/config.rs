//! Configuration view and validation commands: `challenge-harness config`.

use std::path::Path;

use anyhow::{Context, Result};
use console::style;

use challenge_harness::config::{HarnessConfig, TEMPLATE};

use super::super::ConfigCommands;

const MASK: &str = "********";

/// Effective configuration with secrets masked.
fn masked(config: &HarnessConfig) -> HarnessConfig {
    let mut shown = config.clone();
    if !shown.auth.client_secret.is_empty() {
        shown.auth.client_secret = MASK.to_string();
    }
    if shown.auth.static_token.is_some() {
        shown.auth.static_token = Some(MASK.to_string());
    }
    shown
}

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let config = HarnessConfig::load(config_path)?;
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No config file at {}; showing defaults", config_path.display());
            }
            println!("# Effective values (env overrides applied, secrets masked)");
            println!();
            print!("{}", masked(&config).to_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            let config = HarnessConfig::load(config_path)?;
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("{} Configuration is valid", style("✓").green());
            } else {
                println!("{} {} warning(s):", style("!").yellow(), warnings.len());
                for warning in &warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "{} already exists. Use --force to overwrite.",
                    config_path.display()
                );
            }
            if let Some(parent) = config_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            std::fs::write(config_path, TEMPLATE)
                .with_context(|| format!("Failed to write {}", config_path.display()))?;
            println!("Created {}", config_path.display());
        }
    }
    Ok(())
}
