// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # AEGIS Gateway CLI
//!
//! The `aegis-gw` binary runs the credential-isolating gateway sidecar next
//! to an untrusted agent container.
//!
//! ## Commands
//!
//! - `aegis-gw run` - Start the gateway (Control API + allowlist proxy)
//! - `aegis-gw config show|validate` - Configuration management
//! - `aegis-gw allowlist check <host>` - Evaluate a hostname against the
//!   live allowlist
//!
//! Startup is all-or-nothing: any configuration problem prints the specific
//! field and exits non-zero before either listener is bound.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

use commands::{AllowlistCommand, ConfigCommand};

/// AEGIS Gateway - credential-isolating sidecar for agent containers
#[derive(Parser)]
#[command(name = "aegis-gw")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration manifest (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "AEGIS_GW_CONFIG",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "AEGIS_GW_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    #[command(name = "run")]
    Run,

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Allowlist inspection
    #[command(name = "allowlist")]
    Allowlist {
        #[command(subcommand)]
        command: AllowlistCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before clap reads env-backed args.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    match cli.command {
        Commands::Run => commands::run::execute(cli.config).await,
        Commands::Config { command } => commands::config::handle_command(command, cli.config).await,
        Commands::Allowlist { command } => {
            commands::allowlist::handle_command(command, cli.config).await
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    Ok(())
}
