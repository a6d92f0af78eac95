// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Policy Engine
//!
//! The single decision function consulted by both the proxy and the Control
//! API. Pure and side-effect-free: a decision is derived from the request
//! (or tunnel target), the read-only policy configuration, and the
//! already-resolved ownership status. Nothing here touches the network, and
//! decisions are computed fresh per request — never cached across requests
//! with different parameters.
//!
//! Rules are evaluated in order; first match wins:
//!
//! 1. raw IP tunnel target          → deny `direct_ip_blocked`
//! 2. hostname not in allowlist     → deny `not_allowlisted`
//! 3. `Push.force == true`          → deny `force_push_blocked`
//! 4. push to a protected ref       → deny `protected_branch_blocked`
//! 5. close of a PR not ours        → deny `not_owner` / `close_ambiguous`
//! 6. otherwise                     → allow

use std::net::IpAddr;

use crate::domain::allowlist::{normalize_host, Allowlist};
use crate::domain::policy::{
    reason, resolve_close_ownership, OwnershipStatus, PolicyConfig, PolicyDecision,
};
use crate::domain::request::GatewayRequest;

/// Decide whether the proxy may open a tunnel to `host`.
///
/// `host` is the hostname from the CONNECT target, an absolute-URI request
/// line, or a peeked TLS SNI — never a full URL.
pub fn decide_proxy_target(host: &str, allowlist: &Allowlist) -> PolicyDecision {
    if is_ip_literal(host) {
        return PolicyDecision::Deny(reason::DIRECT_IP_BLOCKED);
    }
    if !allowlist.contains(host) {
        return PolicyDecision::Deny(reason::NOT_ALLOWLISTED);
    }
    PolicyDecision::Allow
}

/// Decide whether a Control API operation may proceed.
///
/// `ownership` must already be resolved for `PrClose` (it is ignored for
/// every other operation); resolution failures arrive here as
/// [`OwnershipStatus::Unknown`] and fall into the fail-closed table.
pub fn decide_request(
    request: &GatewayRequest,
    policy: &PolicyConfig,
    ownership: OwnershipStatus,
) -> PolicyDecision {
    match request {
        GatewayRequest::Push { force: true, .. } => {
            PolicyDecision::Deny(reason::FORCE_PUSH_BLOCKED)
        }
        GatewayRequest::Push { ref_name, .. } if policy.ref_is_protected(ref_name) => {
            PolicyDecision::Deny(reason::PROTECTED_BRANCH_BLOCKED)
        }
        GatewayRequest::PrClose { .. } => resolve_close_ownership(ownership),
        _ => PolicyDecision::Allow,
    }
}

/// IP-literal detection for tunnel targets, including bracketed IPv6 as it
/// appears in `CONNECT [::1]:443`.
fn is_ip_literal(host: &str) -> bool {
    let bare = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    bare.parse::<IpAddr>().is_ok()
}
