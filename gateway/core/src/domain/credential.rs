// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Backend Credential
//!
//! The single credential the gateway holds on behalf of the agent. The token
//! never leaves process memory and is never logged; agents only ever see the
//! results of operations performed with it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// An issued backend credential.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub scope: String,
}

impl Credential {
    pub fn new(
        token: impl Into<String>,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        scope: impl Into<String>,
    ) -> Self {
        Self {
            token: token.into(),
            issued_at,
            expires_at,
            scope: scope.into(),
        }
    }

    /// The raw token. Only the backend client should call this.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// True once the credential is inside the proactive-refresh window.
    pub fn expires_within(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        now + margin >= self.expires_at
    }
}

// The token must not leak through Debug formatting of errors or state dumps.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Lifecycle state, reported through `/api/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialState {
    Absent,
    Acquiring,
    Valid,
    Refreshing,
    Expired,
}

impl CredentialState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Acquiring => "acquiring",
            Self::Valid => "valid",
            Self::Refreshing => "refreshing",
            Self::Expired => "expired",
        }
    }
}
