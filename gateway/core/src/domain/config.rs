// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Gateway Configuration Types
//
// Defines the configuration schema for AEGIS gateway sidecar nodes:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Control API surface (bind address, shared secret, timeouts)
// - Proxy surface (bind address, allowlist file, tunnel timeouts)
// - Backend and credential-issuer endpoints
// - Dual-network topology declaration the deployer must satisfy
//
// Secrets are never written into the manifest; the manifest names an
// environment variable and the secret is resolved at load time.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use url::Url;

use crate::domain::allowlist::Allowlist;
use crate::domain::error::ConfigError;
use crate::domain::policy::PolicyConfig;

pub const API_VERSION: &str = "100monkeys.ai/v1";
pub const KIND: &str = "GatewayConfig";

/// Default config discovery locations, in order.
const DISCOVERY_PATHS: &[&str] = &["aegis-gateway.yaml", "/etc/aegis/gateway.yaml"];

/// Top-level Kubernetes-style gateway configuration manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayManifest {
    /// API version (must be "100monkeys.ai/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "GatewayConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: GatewaySpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable gateway instance name.
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySpec {
    pub control: ControlConfig,
    pub proxy: ProxyConfig,
    pub backend: BackendConfig,
    pub issuer: IssuerConfig,
    pub policy: PolicyConfig,
    pub topology: TopologyConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

/// Audit sink destination.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditConfig {
    /// NDJSON file to append to; stdout when unset (log-collector
    /// deployments).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Control API surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Agent-facing listen address, e.g. "10.77.0.1:8787".
    pub bind: SocketAddr,

    /// Name of the environment variable holding the shared secret.
    #[serde(default = "default_secret_env")]
    pub shared_secret_env: String,

    /// TCP connect timeout toward the backend.
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Overall per-request deadline toward the backend.
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
}

/// Forward-proxy surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Agent-facing listen address for CONNECT / absolute-URI traffic.
    pub bind: SocketAddr,

    /// Line-oriented allowlist file (exact hostnames, `#` comments).
    pub allowlist_path: PathBuf,

    /// How long to wait for the TLS ClientHello when peeking SNI.
    #[serde(with = "humantime_serde", default = "default_sni_peek_timeout")]
    pub sni_peek_timeout: Duration,

    /// Tunnels with no bytes in either direction for this long are closed.
    #[serde(with = "humantime_serde", default = "default_idle_tunnel_timeout")]
    pub idle_tunnel_timeout: Duration,
}

/// The authenticated VCS/issue-tracker backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// REST base URL, e.g. "https://api.backend.example".
    pub base_url: String,

    /// Repository the gateway operates on, "owner/name".
    pub repo: String,
}

/// The credential-issuance endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuerConfig {
    /// Token endpoint, e.g. "https://issuer.internal/v1/token".
    pub endpoint: String,

    /// Scope requested for issued credentials.
    pub scope: String,

    /// Refresh this long before expiry.
    #[serde(with = "humantime_serde", default = "default_refresh_margin")]
    pub refresh_margin: Duration,
}

/// The dual-network contract the deployment must satisfy.
///
/// The gateway can verify its own half: both listeners bind on the
/// agent-facing address, and the agent-facing and external addresses are
/// distinct interfaces. The other half — that the agent segment has no
/// default route and no DNS resolvers of its own — is the deployer's
/// obligation and cannot be observed from inside this process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Address on the isolated agent segment. Control and proxy listeners
    /// must bind here.
    pub agent_facing_addr: std::net::IpAddr,

    /// Address on the externally-routable segment used for upstream traffic.
    pub external_addr: std::net::IpAddr,
}

fn default_secret_env() -> String {
    "AEGIS_GW_SECRET".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_sni_peek_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_idle_tunnel_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_refresh_margin() -> Duration {
    Duration::from_secs(600)
}

impl GatewayManifest {
    /// Load the manifest from an explicit path, `AEGIS_GW_CONFIG`, or the
    /// default discovery locations.
    pub async fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => match std::env::var_os("AEGIS_GW_CONFIG") {
                Some(p) => PathBuf::from(p),
                None => DISCOVERY_PATHS
                    .iter()
                    .map(|p| PathBuf::from(*p))
                    .find(|p| p.exists())
                    .ok_or_else(|| {
                        ConfigError::NotFound(DISCOVERY_PATHS.join(", "))
                    })?,
            },
        };
        Self::load(&path).await
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
        let manifest: Self = serde_yaml::from_str(&content)?;
        Ok(manifest)
    }

    /// Validate every field the gateway depends on. Any failure here is
    /// fatal: the binary reports the specific field and exits non-zero
    /// before either listener is bound.
    pub async fn validate(&self) -> Result<(), ConfigError> {
        if self.api_version != API_VERSION {
            return Err(ConfigError::ApiVersion(self.api_version.clone()));
        }
        if self.kind != KIND {
            return Err(ConfigError::Kind(self.kind.clone()));
        }
        if self.metadata.name.trim().is_empty() {
            return Err(ConfigError::MissingField("metadata.name"));
        }

        let spec = &self.spec;

        if spec.control.bind.ip() != spec.topology.agent_facing_addr {
            return Err(ConfigError::InvalidField {
                field: "spec.control.bind",
                detail: format!(
                    "must bind the agent-facing address {} (got {})",
                    spec.topology.agent_facing_addr,
                    spec.control.bind.ip()
                ),
            });
        }
        if spec.proxy.bind.ip() != spec.topology.agent_facing_addr {
            return Err(ConfigError::InvalidField {
                field: "spec.proxy.bind",
                detail: format!(
                    "must bind the agent-facing address {} (got {})",
                    spec.topology.agent_facing_addr,
                    spec.proxy.bind.ip()
                ),
            });
        }
        if spec.topology.agent_facing_addr == spec.topology.external_addr {
            return Err(ConfigError::InvalidField {
                field: "spec.topology",
                detail: "agent_facing_addr and external_addr must be distinct interfaces"
                    .to_string(),
            });
        }

        for (field, value) in [
            ("spec.backend.base_url", &spec.backend.base_url),
            ("spec.issuer.endpoint", &spec.issuer.endpoint),
        ] {
            let url = Url::parse(value).map_err(|e| ConfigError::InvalidField {
                field,
                detail: e.to_string(),
            })?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(ConfigError::InvalidField {
                    field,
                    detail: format!("unsupported scheme {:?}", url.scheme()),
                });
            }
        }

        if spec.backend.repo.split('/').filter(|s| !s.is_empty()).count() != 2 {
            return Err(ConfigError::InvalidField {
                field: "spec.backend.repo",
                detail: format!("expected \"owner/name\", got {:?}", spec.backend.repo),
            });
        }

        if spec.issuer.scope.trim().is_empty() {
            return Err(ConfigError::MissingField("spec.issuer.scope"));
        }
        if spec.policy.owner_login.trim().is_empty() {
            return Err(ConfigError::MissingField("spec.policy.owner_login"));
        }

        // The allowlist must exist and parse before anything is served: a
        // gateway without a valid allowlist has no defined proxy policy.
        let allowlist_path = &spec.proxy.allowlist_path;
        let content = tokio::fs::read_to_string(allowlist_path)
            .await
            .map_err(|source| ConfigError::Io {
                path: allowlist_path.display().to_string(),
                source,
            })?;
        Allowlist::parse(&content).map_err(|source| ConfigError::Allowlist {
            path: allowlist_path.display().to_string(),
            source,
        })?;

        Ok(())
    }

    /// Resolve the shared secret from the configured environment variable.
    pub fn resolve_shared_secret(&self) -> Result<SharedSecret, ConfigError> {
        let var = &self.spec.control.shared_secret_env;
        match std::env::var(var) {
            Ok(value) if !value.trim().is_empty() => Ok(SharedSecret::new(value)),
            _ => Err(ConfigError::InvalidField {
                field: "spec.control.shared_secret_env",
                detail: format!("environment variable {var} is unset or empty"),
            }),
        }
    }
}

/// The bearer secret agents present to the Control API.
///
/// Comparison is constant-time; the value never appears in Debug output,
/// logs, or serialized state.
#[derive(Clone)]
pub struct SharedSecret(String);

impl SharedSecret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn verify(&self, presented: &str) -> bool {
        self.0.as_bytes().ct_eq(presented.as_bytes()).into()
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}
