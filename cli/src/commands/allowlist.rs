// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Allowlist inspection commands
//!
//! Operator debugging aid: evaluate a hostname the way the live proxy
//! would, against the allowlist file named by the configuration.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use aegis_gateway_core::application::policy_engine::decide_proxy_target;
use aegis_gateway_core::domain::allowlist::Allowlist;
use aegis_gateway_core::domain::config::GatewayManifest;
use aegis_gateway_core::domain::policy::PolicyDecision;

#[derive(Subcommand)]
pub enum AllowlistCommand {
    /// Evaluate a hostname against the allowlist
    Check {
        /// Hostname (or CONNECT-style target) to evaluate
        #[arg(value_name = "HOST")]
        host: String,

        /// Allowlist file (default: from configuration)
        #[arg(long, value_name = "FILE")]
        file: Option<PathBuf>,
    },
}

pub async fn handle_command(
    command: AllowlistCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        AllowlistCommand::Check { host, file } => check(host, file, config_override).await,
    }
}

async fn check(
    host: String,
    file: Option<PathBuf>,
    config_override: Option<PathBuf>,
) -> Result<()> {
    let path = match file {
        Some(path) => path,
        None => {
            let manifest = GatewayManifest::discover(config_override.as_deref())
                .await
                .context("Failed to load configuration")?;
            manifest.spec.proxy.allowlist_path
        }
    };

    let content = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read allowlist {}", path.display()))?;
    let allowlist = Allowlist::parse(&content)
        .with_context(|| format!("Failed to parse allowlist {}", path.display()))?;

    match decide_proxy_target(&host, &allowlist) {
        PolicyDecision::Allow => {
            println!("{} {}", "allow:".green().bold(), host);
        }
        PolicyDecision::Deny(reason) => {
            println!("{} {} ({})", "deny:".red().bold(), host, reason);
            std::process::exit(1);
        }
    }

    Ok(())
}
