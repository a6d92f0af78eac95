// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Gateway runtime: validates configuration, wires services, and serves the
//! Control API and the allowlist proxy until SIGTERM/Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use aegis_gateway_core::application::retry::RetryPolicy;
use aegis_gateway_core::application::token_manager::TokenLifecycleManager;
use aegis_gateway_core::domain::config::GatewayManifest;
use aegis_gateway_core::infrastructure::allowlist_store::AllowlistStore;
use aegis_gateway_core::infrastructure::audit_log::AuditLogger;
use aegis_gateway_core::infrastructure::backend::HttpVcsBackend;
use aegis_gateway_core::infrastructure::issuer::HttpCredentialIssuer;
use aegis_gateway_core::infrastructure::proxy::ProxyServer;
use aegis_gateway_core::presentation::api::{self, AppState};

pub async fn execute(config_path: Option<PathBuf>) -> Result<()> {
    let manifest = GatewayManifest::discover(config_path.as_deref())
        .await
        .context("Failed to load configuration")?;

    manifest
        .validate()
        .await
        .context("Configuration validation failed")?;

    let secret = manifest
        .resolve_shared_secret()
        .context("Shared secret missing")?;

    let spec = &manifest.spec;
    info!(name = %manifest.metadata.name, "AEGIS gateway starting");

    // Audit sink
    let audit = match &spec.audit.path {
        Some(path) => Arc::new(
            AuditLogger::to_file(path)
                .await
                .context("Failed to open audit log")?,
        ),
        None => Arc::new(AuditLogger::to_stdout()),
    };

    // Allowlist snapshot + reload
    let allowlist = AllowlistStore::load(&spec.proxy.allowlist_path)
        .await
        .context("Failed to load allowlist")?;

    // Credential source must be reachable before anything is served.
    let issuer = HttpCredentialIssuer::new(
        spec.issuer.endpoint.clone(),
        spec.control.connect_timeout,
        spec.control.request_timeout,
    )
    .context("Failed to build credential issuer client")?;
    issuer
        .preflight()
        .await
        .context("Credential source preflight failed")?;

    let tokens = TokenLifecycleManager::new(
        Arc::new(issuer),
        spec.issuer.scope.clone(),
        spec.issuer.refresh_margin,
    );

    let backend = HttpVcsBackend::new(
        spec.backend.base_url.clone(),
        spec.backend.repo.clone(),
        spec.control.connect_timeout,
        spec.control.request_timeout,
    )
    .context("Failed to build backend client")?;

    let state = Arc::new(AppState {
        secret,
        policy: spec.policy.clone(),
        backend: Arc::new(backend),
        tokens: tokens.clone(),
        audit: audit.clone(),
        allowlist: allowlist.clone(),
        retry: RetryPolicy::default(),
        owned_prs: Default::default(),
    });

    // Bind both agent-facing listeners before spawning anything; a bind
    // failure here is a topology misconfiguration and must abort startup.
    let control_listener = TcpListener::bind(spec.control.bind)
        .await
        .with_context(|| format!("Failed to bind control API to {}", spec.control.bind))?;
    let proxy_listener = TcpListener::bind(spec.proxy.bind)
        .await
        .with_context(|| format!("Failed to bind proxy to {}", spec.proxy.bind))?;

    let shutdown = CancellationToken::new();

    tokio::spawn(tokens.clone().run_refresh_loop(shutdown.clone()));
    tokio::spawn(allowlist.clone().run_watcher(shutdown.clone()));

    let proxy = ProxyServer::new(allowlist, audit, &spec.proxy);
    let proxy_task = tokio::spawn(proxy.run(proxy_listener, shutdown.clone()));

    info!(
        control = %spec.control.bind,
        proxy = %spec.proxy.bind,
        "gateway ready"
    );

    let app = api::router(state);
    axum::serve(control_listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move {
                shutdown_signal().await;
                shutdown.cancel();
            }
        })
        .await
        .context("Control API server failed")?;

    // The credential dies with the process; nothing is persisted.
    shutdown.cancel();
    let _ = proxy_task.await;
    info!("gateway shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
