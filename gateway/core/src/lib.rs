// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # AEGIS Gateway Core
//!
//! Credential-isolating network gateway for untrusted agent containers.
//! The agent holds zero credentials; this sidecar fronts the authenticated
//! backend through a minimal Control API and fronts the general internet
//! through a domain-allowlist forward proxy. Both consult the same policy
//! engine and append to the same audit log.
//!
//! # Architecture
//!
//! - **domain** — request/decision/credential/audit/config types
//! - **application** — policy engine, token lifecycle, retry
//! - **infrastructure** — backend adapter, issuer, proxy, SNI peek, sinks
//! - **presentation** — Control API router and authentication

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
