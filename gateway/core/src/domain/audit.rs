// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Audit Records
//!
//! One immutable [`AuditLogEntry`] is appended for every Control API call and
//! every proxy CONNECT attempt, allowed or denied, before the response is
//! released to the caller. The gateway never mutates or deletes entries;
//! retention and rotation belong to external log management.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::policy::DecisionRecord;
use crate::domain::request::OperationKind;

/// How the operation concluded after the policy decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Allowed and the backend/tunnel action completed.
    Success,
    /// Refused by policy; no upstream side effects.
    Denied,
    /// Allowed but the upstream call or tunnel failed.
    Failed,
}

/// A single append-only audit record, serialized as one NDJSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Who asked: the authenticated control-API caller or the proxy peer
    /// address.
    pub source_identity: String,
    pub operation_kind: OperationKind,
    /// The request as received. For proxy attempts this is the CONNECT
    /// target; the shared secret is never part of any request body.
    pub request: serde_json::Value,
    pub decision: DecisionRecord,
    pub outcome: Outcome,
    pub duration_ms: u64,
    pub gateway_version: String,
}

impl AuditLogEntry {
    pub fn new(
        source_identity: impl Into<String>,
        operation_kind: OperationKind,
        request: serde_json::Value,
        decision: DecisionRecord,
        outcome: Outcome,
        duration_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source_identity: source_identity.into(),
            operation_kind,
            request,
            decision,
            outcome,
            duration_ms,
            gateway_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
