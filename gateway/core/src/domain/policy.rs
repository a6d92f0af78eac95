// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Policy Types
//!
//! The decision vocabulary shared by the Control API and the proxy. The
//! engine that produces decisions lives in
//! [`crate::application::policy_engine`]; this module holds the types and the
//! ambiguity table so the fail-closed behavior stays in one auditable place.

use serde::{Deserialize, Serialize};

/// Machine-readable denial reasons. These appear verbatim in audit records,
/// 403 bodies, and the proxy's `X-Gateway-Deny-Reason` header.
pub mod reason {
    pub const DIRECT_IP_BLOCKED: &str = "direct_ip_blocked";
    pub const NOT_ALLOWLISTED: &str = "not_allowlisted";
    pub const FORCE_PUSH_BLOCKED: &str = "force_push_blocked";
    pub const PROTECTED_BRANCH_BLOCKED: &str = "protected_branch_blocked";
    pub const NOT_OWNER: &str = "not_owner";
    pub const CLOSE_AMBIGUOUS: &str = "close_ambiguous";
}

/// Policy enforcement result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny(&'static str),
}

impl PolicyDecision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }

    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Self::Allow => None,
            Self::Deny(reason) => Some(reason),
        }
    }
}

/// Serialized form of a decision, embedded in every audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub allow: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<&PolicyDecision> for DecisionRecord {
    fn from(decision: &PolicyDecision) -> Self {
        Self {
            allow: decision.is_allow(),
            reason: decision.reason().map(str::to_string),
        }
    }
}

/// What the gateway knows about who opened a pull request.
///
/// `Unknown` covers every case where the backend could not answer: network
/// failure, timeout, malformed response. It is a distinct state rather than
/// a default so the ambiguity table below has to handle it explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipStatus {
    Owned,
    NotOwned,
    Unknown,
}

/// Read-only policy configuration consulted on every Control API decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Ref patterns that may never be pushed to. An entry matches either the
    /// exact ref or, with a trailing `/*`, any ref under that prefix.
    pub protected_refs: Vec<String>,
    /// Backend login the gateway's credential acts as. PRs opened by anyone
    /// else cannot be closed through the gateway.
    pub owner_login: String,
}

impl PolicyConfig {
    pub fn ref_is_protected(&self, ref_name: &str) -> bool {
        self.protected_refs.iter().any(|pattern| {
            if let Some(prefix) = pattern.strip_suffix("/*") {
                ref_name
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('/'))
            } else {
                pattern == ref_name
            }
        })
    }
}

/// The fail-closed table for destructive operations when ownership or
/// protection status could not be established.
///
/// Uncertainty never relaxes a restriction: a destructive operation on a
/// resource in an unknown state is denied, never waved through.
pub fn resolve_close_ownership(status: OwnershipStatus) -> PolicyDecision {
    match status {
        OwnershipStatus::Owned => PolicyDecision::Allow,
        OwnershipStatus::NotOwned => PolicyDecision::Deny(reason::NOT_OWNER),
        OwnershipStatus::Unknown => PolicyDecision::Deny(reason::CLOSE_AMBIGUOUS),
    }
}
