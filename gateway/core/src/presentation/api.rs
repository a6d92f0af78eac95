// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Authenticated Control API
//!
//! The minimal REST surface through which the agent requests credentialed
//! backend operations. The route table is the capability set: push,
//! PR create, PR comment, PR close, health. **There is no merge route**,
//! and [`crate::domain::request::GatewayRequest`] has no merge variant, so
//! a merge cannot be expressed end to end.
//!
//! Every handler follows the same sequence: authenticate (middleware) →
//! build a `GatewayRequest` → `decide()` → on allow, read the credential
//! and call the backend → append exactly one audit record → respond. The
//! audit append completes before the response leaves.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::application::policy_engine::decide_request;
use crate::application::retry::{with_retry, RetryPolicy};
use crate::application::token_manager::TokenLifecycleManager;
use crate::domain::audit::{AuditLogEntry, Outcome};
use crate::domain::config::SharedSecret;
use crate::domain::credential::Credential;
use crate::domain::error::BackendError;
use crate::domain::policy::{DecisionRecord, OwnershipStatus, PolicyConfig, PolicyDecision};
use crate::domain::request::{GatewayRequest, PrId};
use crate::infrastructure::allowlist_store::AllowlistStore;
use crate::infrastructure::audit_log::AuditLogger;
use crate::infrastructure::backend::VcsBackend;
use crate::presentation::auth::require_bearer;

/// Identity recorded in audit entries for authenticated control calls.
/// The shared secret authenticates the one agent container this gateway
/// fronts; there is no finer-grained caller identity to record.
const CONTROL_IDENTITY: &str = "agent";

pub struct AppState {
    pub secret: SharedSecret,
    pub policy: PolicyConfig,
    pub backend: Arc<dyn VcsBackend>,
    pub tokens: Arc<TokenLifecycleManager>,
    pub audit: Arc<AuditLogger>,
    pub allowlist: Arc<AllowlistStore>,
    pub retry: RetryPolicy,
    /// PRs opened through this gateway. Lets `PrClose` stay decidable for
    /// our own PRs during a brief backend outage.
    pub owned_prs: RwLock<HashSet<u64>>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let authed = Router::new()
        .route("/api/git/push", post(push))
        .route("/api/pr/create", post(pr_create))
        .route("/api/pr/comment", post(pr_comment))
        .route("/api/pr/close", post(pr_close))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer,
        ));

    Router::new()
        .route("/api/health", get(health))
        .merge(authed)
        .with_state(state)
}

#[derive(Deserialize)]
struct PushBody {
    #[serde(rename = "ref")]
    ref_name: String,
    #[serde(rename = "commitSHA")]
    commit_sha: String,
    #[serde(default)]
    force: bool,
}

#[derive(Deserialize)]
struct PrCreateBody {
    base: String,
    head: String,
    title: String,
    body: String,
}

#[derive(Deserialize)]
struct PrCommentBody {
    #[serde(rename = "prId")]
    pr_id: u64,
    body: String,
}

#[derive(Deserialize)]
struct PrCloseBody {
    #[serde(rename = "prId")]
    pr_id: u64,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let credential_state = state.tokens.state().await;
    let reload_error = state.allowlist.last_reload_error();
    let status = if reload_error.is_some() {
        "degraded"
    } else {
        "ok"
    };
    Json(json!({
        "status": status,
        "credentialState": credential_state.as_str(),
        "allowlistEntries": state.allowlist.snapshot().len(),
        "allowlistReloadError": reload_error,
    }))
}

async fn push(State(state): State<Arc<AppState>>, Json(body): Json<PushBody>) -> Response {
    let PushBody {
        ref_name,
        commit_sha,
        force,
    } = body;
    let request = GatewayRequest::Push {
        ref_name: ref_name.clone(),
        commit_sha: commit_sha.clone(),
        force,
    };
    let started = Instant::now();

    let decision = decide_request(&request, &state.policy, OwnershipStatus::Unknown);
    if let PolicyDecision::Deny(reason) = decision {
        return deny(&state, &request, reason, started).await;
    }

    let credential = match state.tokens.current().await {
        Ok(credential) => credential,
        Err(e) => return credential_failure(&state, &request, &e.to_string(), started).await,
    };

    // Push is never auto-retried: a duplicate attempt after a timeout can
    // double-apply side effects. Retry policy belongs to the caller here.
    let result = state.backend.push(&credential, &ref_name, &commit_sha).await;

    match result {
        Ok(new_sha) => {
            info!(r#ref = %ref_name, sha = %new_sha, "push accepted");
            respond(
                &state,
                &request,
                Outcome::Success,
                started,
                (StatusCode::OK, Json(json!({"newSha": new_sha}))).into_response(),
            )
            .await
        }
        Err(e) => backend_failure(&state, &request, e, started).await,
    }
}

async fn pr_create(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PrCreateBody>,
) -> Response {
    let PrCreateBody {
        base,
        head,
        title,
        body: body_text,
    } = body;
    let request = GatewayRequest::PrCreate {
        base: base.clone(),
        head: head.clone(),
        title: title.clone(),
        body: body_text.clone(),
    };
    let started = Instant::now();

    let decision = decide_request(&request, &state.policy, OwnershipStatus::Unknown);
    if let PolicyDecision::Deny(reason) = decision {
        return deny(&state, &request, reason, started).await;
    }

    let credential = match state.tokens.current().await {
        Ok(credential) => credential,
        Err(e) => return credential_failure(&state, &request, &e.to_string(), started).await,
    };

    let result = state
        .backend
        .create_pr(&credential, &base, &head, &title, &body_text)
        .await;

    match result {
        Ok(pr) => {
            state.owned_prs.write().insert(pr.id.as_u64());
            info!(pr = %pr.id, "pull request created");
            respond(
                &state,
                &request,
                Outcome::Success,
                started,
                (
                    StatusCode::OK,
                    Json(json!({"prId": pr.id.as_u64(), "url": pr.url})),
                )
                    .into_response(),
            )
            .await
        }
        Err(e) => backend_failure(&state, &request, e, started).await,
    }
}

async fn pr_comment(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PrCommentBody>,
) -> Response {
    let pr_id = PrId(body.pr_id);
    let comment_body = body.body;
    let request = GatewayRequest::PrComment {
        pr_id,
        body: comment_body.clone(),
    };
    let started = Instant::now();

    let decision = decide_request(&request, &state.policy, OwnershipStatus::Unknown);
    if let PolicyDecision::Deny(reason) = decision {
        return deny(&state, &request, reason, started).await;
    }

    let credential = match state.tokens.current().await {
        Ok(credential) => credential,
        Err(e) => return credential_failure(&state, &request, &e.to_string(), started).await,
    };

    let backend = state.backend.clone();
    let idempotent = request.is_idempotent();
    let result = with_retry(state.retry, idempotent, || {
        let backend = backend.clone();
        let credential = credential.clone();
        let comment_body = comment_body.clone();
        async move { backend.comment_pr(&credential, pr_id, &comment_body).await }
    })
    .await;

    match result {
        Ok(()) => {
            respond(
                &state,
                &request,
                Outcome::Success,
                started,
                (StatusCode::OK, Json(json!({}))).into_response(),
            )
            .await
        }
        Err(e) => backend_failure(&state, &request, e, started).await,
    }
}

async fn pr_close(State(state): State<Arc<AppState>>, Json(body): Json<PrCloseBody>) -> Response {
    let pr_id = PrId(body.pr_id);
    let request = GatewayRequest::PrClose { pr_id };
    let started = Instant::now();

    let credential = match state.tokens.current().await {
        Ok(credential) => credential,
        Err(e) => return credential_failure(&state, &request, &e.to_string(), started).await,
    };

    let ownership = match resolve_ownership(&state, &credential, pr_id).await {
        Ok(status) => status,
        Err(BackendError::NotFound(_)) => {
            // No policy objection; the resource simply does not exist.
            return respond_with_outcome(
                &state,
                &request,
                &PolicyDecision::Allow,
                Outcome::Failed,
                started,
                (StatusCode::NOT_FOUND, Json(json!({}))).into_response(),
            )
            .await;
        }
        // Unreachable backend: fall into the fail-closed ambiguity table.
        Err(_) => OwnershipStatus::Unknown,
    };

    let decision = decide_request(&request, &state.policy, ownership);
    if let PolicyDecision::Deny(reason) = decision {
        return deny(&state, &request, reason, started).await;
    }

    let backend = state.backend.clone();
    let idempotent = request.is_idempotent();
    let result = with_retry(state.retry, idempotent, || {
        let backend = backend.clone();
        let credential = credential.clone();
        async move { backend.close_pr(&credential, pr_id).await }
    })
    .await;

    match result {
        Ok(()) => {
            info!(pr = %pr_id, "pull request closed");
            respond(
                &state,
                &request,
                Outcome::Success,
                started,
                (StatusCode::OK, Json(json!({}))).into_response(),
            )
            .await
        }
        Err(e) => backend_failure(&state, &request, e, started).await,
    }
}

/// Who opened this PR? Gateway-created PRs are answered locally; everything
/// else asks the backend. Failures other than NotFound degrade to Unknown,
/// which the decision table turns into a deny.
async fn resolve_ownership(
    state: &AppState,
    credential: &Credential,
    pr_id: PrId,
) -> Result<OwnershipStatus, BackendError> {
    if state.owned_prs.read().contains(&pr_id.as_u64()) {
        return Ok(OwnershipStatus::Owned);
    }
    let author = state.backend.pr_author(credential, pr_id).await?;
    if author == state.policy.owner_login {
        Ok(OwnershipStatus::Owned)
    } else {
        Ok(OwnershipStatus::NotOwned)
    }
}

async fn deny(
    state: &AppState,
    request: &GatewayRequest,
    reason: &'static str,
    started: Instant,
) -> Response {
    warn!(
        operation = request.operation_kind().as_str(),
        reason, "operation denied by policy"
    );
    respond_with_outcome(
        state,
        request,
        &PolicyDecision::Deny(reason),
        Outcome::Denied,
        started,
        (StatusCode::FORBIDDEN, Json(json!({"reason": reason}))).into_response(),
    )
    .await
}

async fn credential_failure(
    state: &AppState,
    request: &GatewayRequest,
    detail: &str,
    started: Instant,
) -> Response {
    respond_with_outcome(
        state,
        request,
        &PolicyDecision::Allow,
        Outcome::Failed,
        started,
        (
            StatusCode::BAD_GATEWAY,
            Json(json!({"detail": format!("credential unavailable: {detail}")})),
        )
            .into_response(),
    )
    .await
}

async fn backend_failure(
    state: &AppState,
    request: &GatewayRequest,
    error: BackendError,
    started: Instant,
) -> Response {
    let response = match &error {
        BackendError::NotFound(_) => (StatusCode::NOT_FOUND, Json(json!({}))).into_response(),
        BackendError::Timeout => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(json!({"detail": "backend request timed out"})),
        )
            .into_response(),
        BackendError::Transient { detail, .. } | BackendError::Permanent { detail, .. } => (
            StatusCode::BAD_GATEWAY,
            Json(json!({"detail": detail})),
        )
            .into_response(),
    };
    warn!(
        operation = request.operation_kind().as_str(),
        error = %error,
        "backend call failed"
    );
    respond_with_outcome(
        state,
        request,
        &PolicyDecision::Allow,
        Outcome::Failed,
        started,
        response,
    )
    .await
}

async fn respond(
    state: &AppState,
    request: &GatewayRequest,
    outcome: Outcome,
    started: Instant,
    response: Response,
) -> Response {
    respond_with_outcome(
        state,
        request,
        &PolicyDecision::Allow,
        outcome,
        started,
        response,
    )
    .await
}

/// Append the audit record, then release the response. Log-then-respond:
/// a client never sees a result that has no audit entry.
async fn respond_with_outcome(
    state: &AppState,
    request: &GatewayRequest,
    decision: &PolicyDecision,
    outcome: Outcome,
    started: Instant,
    response: Response,
) -> Response {
    let entry = AuditLogEntry::new(
        CONTROL_IDENTITY,
        request.operation_kind(),
        serde_json::to_value(request).unwrap_or_default(),
        DecisionRecord::from(decision),
        outcome,
        started.elapsed().as_millis() as u64,
    );
    state.audit.append_best_effort(&entry).await;
    response
}
