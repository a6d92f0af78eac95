// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod allowlist;
pub mod config;
pub mod run;

pub use allowlist::AllowlistCommand;
pub use config::ConfigCommand;
