// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Token Lifecycle Manager
//!
//! Sole custodian of the backend credential. Exactly one live credential
//! exists per gateway process; every other component reads it through
//! [`TokenLifecycleManager::current`], which blocks only during the narrow
//! acquiring/refreshing window.
//!
//! State machine: absent → acquiring → valid → refreshing → valid (rotated)
//! → expired (discarded).
//!
//! Concurrency: double-checked locking. The read path takes a shared lock
//! and returns immediately while the credential is valid. Acquisition and
//! refresh serialize on a single-flight mutex and re-check under it, so N
//! concurrent callers hitting an empty or stale credential trigger exactly
//! one upstream issuance call.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::credential::{Credential, CredentialState};

/// Polling interval of the refresh loop while no credential is held.
const ABSENT_POLL_INTERVAL: StdDuration = StdDuration::from_secs(15);

/// Floor between refresh-loop wakeups. Keeps an issuer whose token TTL is
/// shorter than the refresh margin from turning the loop hot.
const MIN_REFRESH_INTERVAL: StdDuration = StdDuration::from_secs(1);

#[derive(Debug, Error)]
pub enum IssuerError {
    #[error("credential endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("credential issuance rejected: {0}")]
    Rejected(String),

    #[error("malformed issuance response: {0}")]
    Malformed(String),
}

/// Seam to the backend's credential-issuance endpoint.
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn issue(&self, scope: &str) -> Result<Credential, IssuerError>;
}

// Lifecycle phase, stored as an atomic so `state()` never contends with the
// credential locks.
const PHASE_ABSENT: u8 = 0;
const PHASE_ACQUIRING: u8 = 1;
const PHASE_VALID: u8 = 2;
const PHASE_REFRESHING: u8 = 3;

pub struct TokenLifecycleManager {
    issuer: Arc<dyn CredentialIssuer>,
    scope: String,
    refresh_margin: Duration,
    current: RwLock<Option<Credential>>,
    /// Single-flight guard: at most one issuance call is in flight.
    acquire: Mutex<()>,
    phase: AtomicU8,
}

impl TokenLifecycleManager {
    pub fn new(
        issuer: Arc<dyn CredentialIssuer>,
        scope: impl Into<String>,
        refresh_margin: StdDuration,
    ) -> Arc<Self> {
        let refresh_margin =
            Duration::from_std(refresh_margin).unwrap_or_else(|_| Duration::minutes(10));
        Arc::new(Self {
            issuer,
            scope: scope.into(),
            refresh_margin,
            current: RwLock::new(None),
            acquire: Mutex::new(()),
            phase: AtomicU8::new(PHASE_ABSENT),
        })
    }

    /// The current valid credential, acquiring one if necessary.
    ///
    /// Readers arriving during a proactive refresh receive the still-valid
    /// old credential; readers arriving while no valid credential exists
    /// wait for the in-flight acquisition (or its error).
    pub async fn current(&self) -> Result<Credential, IssuerError> {
        // Fast path: shared lock, no issuance.
        if let Some(cred) = self.current.read().await.as_ref() {
            if !cred.is_expired(Utc::now()) {
                return Ok(cred.clone());
            }
        }

        let _guard = self.acquire.lock().await;

        // Re-check: another caller may have acquired while we waited.
        if let Some(cred) = self.current.read().await.as_ref() {
            if !cred.is_expired(Utc::now()) {
                return Ok(cred.clone());
            }
        }

        self.phase.store(PHASE_ACQUIRING, Ordering::SeqCst);
        match self.issuer.issue(&self.scope).await {
            Ok(cred) => {
                info!(
                    scope = %self.scope,
                    expires_at = %cred.expires_at,
                    "acquired backend credential"
                );
                *self.current.write().await = Some(cred.clone());
                self.phase.store(PHASE_VALID, Ordering::SeqCst);
                Ok(cred)
            }
            Err(e) => {
                // Never serve a stale credential silently: drop back to
                // absent and surface the failure to the caller.
                error!(error = %e, "credential acquisition failed");
                *self.current.write().await = None;
                self.phase.store(PHASE_ABSENT, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Rotate the credential if it is inside the refresh window. Called by
    /// the background loop; harmless to call early.
    pub async fn refresh_if_due(&self) {
        let due = {
            let guard = self.current.read().await;
            match guard.as_ref() {
                Some(cred) => cred.expires_within(self.refresh_margin, Utc::now()),
                None => false,
            }
        };
        if !due {
            return;
        }

        let _guard = self.acquire.lock().await;

        // Re-check under the lock: a concurrent acquisition may have
        // already rotated it.
        let still_due = {
            let guard = self.current.read().await;
            match guard.as_ref() {
                Some(cred) => cred.expires_within(self.refresh_margin, Utc::now()),
                None => false,
            }
        };
        if !still_due {
            return;
        }

        self.phase.store(PHASE_REFRESHING, Ordering::SeqCst);
        match self.issuer.issue(&self.scope).await {
            Ok(new_cred) => {
                info!(expires_at = %new_cred.expires_at, "rotated backend credential");
                // Atomic swap: readers held the old credential until this
                // write commits.
                *self.current.write().await = Some(new_cred);
                self.phase.store(PHASE_VALID, Ordering::SeqCst);
            }
            Err(e) => {
                // The old credential is still valid; keep serving it and
                // retry on the next tick. If it expires before a refresh
                // succeeds, `current()` surfaces the failure.
                warn!(error = %e, "proactive refresh failed, keeping current credential");
                self.phase.store(PHASE_VALID, Ordering::SeqCst);
            }
        }
    }

    /// Lifecycle state for `/api/health`.
    pub async fn state(&self) -> CredentialState {
        match self.phase.load(Ordering::SeqCst) {
            PHASE_ACQUIRING => CredentialState::Acquiring,
            PHASE_REFRESHING => CredentialState::Refreshing,
            PHASE_VALID => {
                let guard = self.current.read().await;
                match guard.as_ref() {
                    Some(cred) if !cred.is_expired(Utc::now()) => CredentialState::Valid,
                    Some(_) => CredentialState::Expired,
                    None => CredentialState::Absent,
                }
            }
            _ => CredentialState::Absent,
        }
    }

    /// Background loop driving proactive refresh. Runs until `shutdown` is
    /// cancelled; the credential dies with the process.
    pub async fn run_refresh_loop(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let sleep_for = self.next_wakeup().await;
            debug!(sleep_secs = sleep_for.as_secs(), "refresh loop sleeping");
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("refresh loop shutting down");
                    return;
                }
                _ = tokio::time::sleep(sleep_for) => {
                    self.refresh_if_due().await;
                }
            }
        }
    }

    async fn next_wakeup(&self) -> StdDuration {
        let guard = self.current.read().await;
        match guard.as_ref() {
            Some(cred) => {
                let refresh_at = cred.expires_at - self.refresh_margin;
                let until = refresh_at - Utc::now();
                until
                    .to_std()
                    .unwrap_or(StdDuration::ZERO)
                    .max(MIN_REFRESH_INTERVAL)
            }
            None => ABSENT_POLL_INTERVAL,
        }
    }
}
