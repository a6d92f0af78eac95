// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Gateway Request Model
//!
//! The closed set of backend operations an agent may request through the
//! gateway. The enum is the API surface: an operation that is not a variant
//! here cannot be expressed anywhere in the system, so omissions are
//! structural rather than enforced by runtime checks.
//!
//! There is deliberately **no merge variant**. Merging is reserved for a
//! human on the backend's own UI.

use serde::{Deserialize, Serialize};

/// Identifier of a pull request on the upstream backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrId(pub u64);

impl PrId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for PrId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An authenticated backend operation requested by the agent.
///
/// Closed sum type: every credentialed action the gateway can take on the
/// agent's behalf is one of these variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GatewayRequest {
    Push {
        /// Fully-qualified ref, e.g. `refs/heads/feature-x`.
        #[serde(rename = "ref")]
        ref_name: String,
        #[serde(rename = "commitSHA")]
        commit_sha: String,
        force: bool,
    },
    PrCreate {
        base: String,
        head: String,
        title: String,
        body: String,
    },
    PrComment {
        #[serde(rename = "prId")]
        pr_id: PrId,
        body: String,
    },
    PrClose {
        #[serde(rename = "prId")]
        pr_id: PrId,
    },
}

/// Operation labels used in audit records and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Push,
    PrCreate,
    PrComment,
    PrClose,
    /// A proxy CONNECT or absolute-URI tunnel attempt.
    ProxyConnect,
}

impl OperationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::PrCreate => "pr_create",
            Self::PrComment => "pr_comment",
            Self::PrClose => "pr_close",
            Self::ProxyConnect => "proxy_connect",
        }
    }
}

impl GatewayRequest {
    pub fn operation_kind(&self) -> OperationKind {
        match self {
            Self::Push { .. } => OperationKind::Push,
            Self::PrCreate { .. } => OperationKind::PrCreate,
            Self::PrComment { .. } => OperationKind::PrComment,
            Self::PrClose { .. } => OperationKind::PrClose,
        }
    }

    /// Whether the operation is safe to retry after a transient backend
    /// failure. Push is excluded: a retried push can duplicate side effects
    /// if the first attempt landed after the timeout fired.
    pub fn is_idempotent(&self) -> bool {
        matches!(self, Self::PrComment { .. } | Self::PrClose { .. })
    }
}
