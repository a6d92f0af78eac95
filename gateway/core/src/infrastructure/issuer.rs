// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Credential Issuer Adapter
//
// HTTP client for the backend's credential-issuance endpoint. Only the
// TokenLifecycleManager calls this; issued tokens live in process memory
// and are never persisted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::application::token_manager::{CredentialIssuer, IssuerError};
use crate::domain::credential::Credential;
use crate::domain::error::ConfigError;

pub struct HttpCredentialIssuer {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Serialize)]
struct IssueRequest<'a> {
    scope: &'a str,
}

#[derive(Deserialize)]
struct IssueResponse {
    token: String,
    expires_at: DateTime<Utc>,
    #[serde(default)]
    scope: Option<String>,
}

impl HttpCredentialIssuer {
    pub fn new(
        endpoint: impl Into<String>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    /// Startup reachability probe. The gateway refuses to start when its
    /// credential source cannot be reached: better a clean non-zero exit
    /// than a gateway that accepts requests it can never serve.
    pub async fn preflight(&self) -> Result<(), ConfigError> {
        self.client
            .head(&self.endpoint)
            .send()
            .await
            .map_err(|e| ConfigError::IssuerUnreachable {
                endpoint: self.endpoint.clone(),
                detail: e.to_string(),
            })?;
        Ok(())
    }
}

#[async_trait]
impl CredentialIssuer for HttpCredentialIssuer {
    async fn issue(&self, scope: &str) -> Result<Credential, IssuerError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&IssueRequest { scope })
            .send()
            .await
            .map_err(|e| IssuerError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(IssuerError::Rejected(format!("{status}: {detail}")));
        }

        let parsed: IssueResponse = response
            .json()
            .await
            .map_err(|e| IssuerError::Malformed(e.to_string()))?;

        Ok(Credential::new(
            parsed.token,
            Utc::now(),
            parsed.expires_at,
            parsed.scope.unwrap_or_else(|| scope.to_string()),
        ))
    }
}
