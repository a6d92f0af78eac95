// VCS Backend Adapter
//
// Anti-Corruption Layer for the GitHub-shaped REST backend. The rest of the
// gateway speaks GatewayRequest; only this module knows the backend's wire
// shapes. The credential is injected per call so rotation never invalidates
// a held client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::credential::Credential;
use crate::domain::error::BackendError;
use crate::domain::request::PrId;

/// A pull request created through the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrRef {
    pub id: PrId,
    pub url: String,
}

/// The authenticated operations the gateway performs upstream.
///
/// Mirrors [`crate::domain::request::GatewayRequest`] exactly: there is no
/// merge method here either, so no code path can complete one.
#[async_trait]
pub trait VcsBackend: Send + Sync {
    /// Fast-forward `ref_name` to `commit_sha`; returns the new ref SHA.
    async fn push(
        &self,
        credential: &Credential,
        ref_name: &str,
        commit_sha: &str,
    ) -> Result<String, BackendError>;

    async fn create_pr(
        &self,
        credential: &Credential,
        base: &str,
        head: &str,
        title: &str,
        body: &str,
    ) -> Result<PrRef, BackendError>;

    async fn comment_pr(
        &self,
        credential: &Credential,
        pr_id: PrId,
        body: &str,
    ) -> Result<(), BackendError>;

    async fn close_pr(&self, credential: &Credential, pr_id: PrId) -> Result<(), BackendError>;

    /// Login of the identity that opened the PR, for ownership checks.
    async fn pr_author(
        &self,
        credential: &Credential,
        pr_id: PrId,
    ) -> Result<String, BackendError>;
}

pub struct HttpVcsBackend {
    client: reqwest::Client,
    base_url: String,
    repo: String,
}

#[derive(Serialize)]
struct UpdateRefRequest<'a> {
    sha: &'a str,
    force: bool,
}

#[derive(Deserialize)]
struct RefResponse {
    object: RefObject,
}

#[derive(Deserialize)]
struct RefObject {
    sha: String,
}

#[derive(Serialize)]
struct CreatePrRequest<'a> {
    title: &'a str,
    head: &'a str,
    base: &'a str,
    body: &'a str,
}

#[derive(Deserialize)]
struct PrResponse {
    number: u64,
    html_url: String,
}

#[derive(Serialize)]
struct CommentRequest<'a> {
    body: &'a str,
}

#[derive(Serialize)]
struct ClosePrRequest {
    state: &'static str,
}

#[derive(Deserialize)]
struct PrDetailResponse {
    user: PrUser,
}

#[derive(Deserialize)]
struct PrUser {
    login: String,
}

impl HttpVcsBackend {
    pub fn new(
        base_url: impl Into<String>,
        repo: impl Into<String>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            repo: repo.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/repos/{}/{}", self.base_url, self.repo, path)
    }

    fn bearer(credential: &Credential) -> String {
        format!("Bearer {}", credential.token())
    }

    async fn classify(response: reqwest::Response) -> BackendError {
        let status = response.status().as_u16();
        let detail = response.text().await.unwrap_or_default();
        match status {
            404 => BackendError::NotFound(detail),
            408 | 429 | 500..=599 => BackendError::Transient {
                status: Some(status),
                detail,
            },
            _ => BackendError::Permanent {
                status: Some(status),
                detail,
            },
        }
    }

    fn transport_error(err: reqwest::Error) -> BackendError {
        if err.is_timeout() {
            BackendError::Timeout
        } else {
            BackendError::Transient {
                status: None,
                detail: err.to_string(),
            }
        }
    }
}

#[async_trait]
impl VcsBackend for HttpVcsBackend {
    async fn push(
        &self,
        credential: &Credential,
        ref_name: &str,
        commit_sha: &str,
    ) -> Result<String, BackendError> {
        // The refs API addresses "heads/feature-x", not "refs/heads/...".
        let short_ref = ref_name.strip_prefix("refs/").unwrap_or(ref_name);
        let response = self
            .client
            .patch(self.url(&format!("git/refs/{short_ref}")))
            .header("Authorization", Self::bearer(credential))
            .json(&UpdateRefRequest {
                sha: commit_sha,
                // Always fast-forward. Force pushes are denied by policy
                // before this adapter is reached; the wire request pins the
                // same guarantee.
                force: false,
            })
            .send()
            .await
            .map_err(Self::transport_error)?;

        if !response.status().is_success() {
            return Err(Self::classify(response).await);
        }
        let parsed: RefResponse = response.json().await.map_err(|e| BackendError::Permanent {
            status: None,
            detail: format!("malformed ref response: {e}"),
        })?;
        Ok(parsed.object.sha)
    }

    async fn create_pr(
        &self,
        credential: &Credential,
        base: &str,
        head: &str,
        title: &str,
        body: &str,
    ) -> Result<PrRef, BackendError> {
        let response = self
            .client
            .post(self.url("pulls"))
            .header("Authorization", Self::bearer(credential))
            .json(&CreatePrRequest {
                title,
                head,
                base,
                body,
            })
            .send()
            .await
            .map_err(Self::transport_error)?;

        if !response.status().is_success() {
            return Err(Self::classify(response).await);
        }
        let parsed: PrResponse = response.json().await.map_err(|e| BackendError::Permanent {
            status: None,
            detail: format!("malformed pull-request response: {e}"),
        })?;
        Ok(PrRef {
            id: PrId(parsed.number),
            url: parsed.html_url,
        })
    }

    async fn comment_pr(
        &self,
        credential: &Credential,
        pr_id: PrId,
        body: &str,
    ) -> Result<(), BackendError> {
        let response = self
            .client
            .post(self.url(&format!("issues/{}/comments", pr_id.as_u64())))
            .header("Authorization", Self::bearer(credential))
            .json(&CommentRequest { body })
            .send()
            .await
            .map_err(Self::transport_error)?;

        if !response.status().is_success() {
            return Err(Self::classify(response).await);
        }
        Ok(())
    }

    async fn close_pr(&self, credential: &Credential, pr_id: PrId) -> Result<(), BackendError> {
        let response = self
            .client
            .patch(self.url(&format!("pulls/{}", pr_id.as_u64())))
            .header("Authorization", Self::bearer(credential))
            .json(&ClosePrRequest { state: "closed" })
            .send()
            .await
            .map_err(Self::transport_error)?;

        if !response.status().is_success() {
            return Err(Self::classify(response).await);
        }
        Ok(())
    }

    async fn pr_author(
        &self,
        credential: &Credential,
        pr_id: PrId,
    ) -> Result<String, BackendError> {
        let response = self
            .client
            .get(self.url(&format!("pulls/{}", pr_id.as_u64())))
            .header("Authorization", Self::bearer(credential))
            .send()
            .await
            .map_err(Self::transport_error)?;

        if !response.status().is_success() {
            return Err(Self::classify(response).await);
        }
        let parsed: PrDetailResponse =
            response.json().await.map_err(|e| BackendError::Permanent {
                status: None,
                detail: format!("malformed pull-request response: {e}"),
            })?;
        Ok(parsed.user.login)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn credential() -> Credential {
        let now = Utc::now();
        Credential::new("ghs_test", now, now + chrono::Duration::hours(1), "repo")
    }

    fn backend(server_url: &str) -> HttpVcsBackend {
        HttpVcsBackend::new(
            server_url,
            "monkeys/banana",
            Duration::from_secs(5),
            Duration::from_secs(10),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn push_updates_ref_and_returns_sha() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PATCH", "/repos/monkeys/banana/git/refs/heads/feature-x")
            .match_header("authorization", "Bearer ghs_test")
            .match_body(mockito::Matcher::Json(serde_json::json!({
                "sha": "abc123",
                "force": false,
            })))
            .with_status(200)
            .with_body(r#"{"object": {"sha": "abc123"}}"#)
            .create_async()
            .await;

        let sha = backend(&server.url())
            .push(&credential(), "refs/heads/feature-x", "abc123")
            .await
            .unwrap();

        assert_eq!(sha, "abc123");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn missing_pr_maps_to_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/repos/monkeys/banana/pulls/99")
            .with_status(404)
            .with_body(r#"{"message": "Not Found"}"#)
            .create_async()
            .await;

        let err = backend(&server.url())
            .pr_author(&credential(), PrId(99))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NotFound(_)));
    }

    #[tokio::test]
    async fn server_errors_classify_as_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/repos/monkeys/banana/pulls")
            .with_status(503)
            .create_async()
            .await;

        let err = backend(&server.url())
            .create_pr(&credential(), "main", "feature-x", "t", "b")
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn validation_errors_classify_as_permanent() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/repos/monkeys/banana/pulls")
            .with_status(422)
            .with_body(r#"{"message": "Validation Failed"}"#)
            .create_async()
            .await;

        let err = backend(&server.url())
            .create_pr(&credential(), "main", "feature-x", "t", "b")
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Permanent { status: Some(422), .. }));
    }
}
