// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use aegis_gateway_core::domain::config::GatewayManifest;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show,

    /// Validate configuration file, allowlist, and secret presence
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show => show(config_override).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
    }
}

async fn show(config_override: Option<PathBuf>) -> Result<()> {
    let manifest = GatewayManifest::discover(config_override.as_deref())
        .await
        .context("Failed to load configuration")?;

    println!("{}", "Current configuration:".bold());
    println!();
    // The manifest never contains the secret itself, only the name of the
    // environment variable holding it, so it is safe to print whole.
    println!("{}", serde_yaml::to_string(&manifest)?);
    Ok(())
}

async fn validate(path: Option<PathBuf>) -> Result<()> {
    let manifest = GatewayManifest::discover(path.as_deref())
        .await
        .context("Failed to load configuration")?;

    manifest
        .validate()
        .await
        .context("Configuration validation failed")?;
    println!("{} manifest and allowlist", "valid:".green().bold());

    match manifest.resolve_shared_secret() {
        Ok(_) => println!(
            "{} shared secret present in ${}",
            "valid:".green().bold(),
            manifest.spec.control.shared_secret_env
        ),
        Err(e) => {
            println!("{} {}", "invalid:".red().bold(), e);
            std::process::exit(1);
        }
    }

    Ok(())
}
