// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Control API Authentication
//!
//! Every authenticated route requires `Authorization: Bearer <shared-secret>`.
//! The comparison is constant-time and happens before any policy evaluation
//! or request parsing; a missing or wrong secret is a 401 with no further
//! processing. `/api/health` is mounted outside this middleware.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header::AUTHORIZATION, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::warn;

use crate::presentation::api::AppState;

pub async fn require_bearer(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|presented| state.secret.verify(presented))
        .unwrap_or(false);

    if !authorized {
        warn!("control api request rejected: missing or invalid shared secret");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "unauthorized"})),
        )
            .into_response();
    }

    next.run(request).await
}
