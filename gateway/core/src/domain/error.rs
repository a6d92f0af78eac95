// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Error taxonomy for gateway operations.
//!
//! Authentication failures (401) and policy violations (403) are produced
//! directly at the API surface and never retried. Backend failures split
//! into transient (retryable for idempotent operations) and permanent.
//! Configuration errors exist only at startup; the gateway exits rather
//! than running partially configured.

use thiserror::Error;

/// Upstream/network failure classes, as seen by the Control API.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The referenced resource does not exist upstream.
    #[error("not found: {0}")]
    NotFound(String),

    /// Transient upstream failure (connect errors, 408/429/5xx). Safe to
    /// retry for idempotent operations.
    #[error("transient backend failure: {detail}")]
    Transient {
        status: Option<u16>,
        detail: String,
    },

    /// Permanent upstream rejection (other 4xx, malformed responses).
    #[error("permanent backend failure: {detail}")]
    Permanent {
        status: Option<u16>,
        detail: String,
    },

    /// The overall request deadline elapsed.
    #[error("backend request timed out")]
    Timeout,
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout)
    }
}

/// Fatal startup problems. Every variant names the offending field so the
/// operator can fix the manifest without reading source.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found at {0}")]
    NotFound(String),

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config manifest: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("unsupported apiVersion {0:?} (expected \"100monkeys.ai/v1\")")]
    ApiVersion(String),

    #[error("unsupported kind {0:?} (expected \"GatewayConfig\")")]
    Kind(String),

    #[error("missing or empty field: {0}")]
    MissingField(&'static str),

    #[error("invalid value for {field}: {detail}")]
    InvalidField {
        field: &'static str,
        detail: String,
    },

    #[error("allowlist at {path} is invalid: {source}")]
    Allowlist {
        path: String,
        #[source]
        source: crate::domain::allowlist::AllowlistError,
    },

    #[error("credential source preflight failed for {endpoint}: {detail}")]
    IssuerUnreachable { endpoint: String, detail: String },
}
