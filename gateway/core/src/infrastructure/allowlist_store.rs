// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Allowlist Store
//!
//! Holds the live [`Allowlist`] snapshot and reloads it when the file
//! changes (notify watcher) or on SIGHUP. Readers always see one complete
//! snapshot: a reload parses the whole file first and swaps the `Arc` in a
//! single write, so a decision never observes a partially-updated list.
//!
//! A failed reload keeps the previous snapshot and records the error for
//! the health endpoint.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::domain::allowlist::{Allowlist, AllowlistError};

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("failed to read allowlist file: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Parse(#[from] AllowlistError),
}

pub struct AllowlistStore {
    path: PathBuf,
    current: RwLock<Arc<Allowlist>>,
    last_reload_error: RwLock<Option<String>>,
}

impl AllowlistStore {
    /// Load the initial snapshot. Startup fails hard on an unreadable or
    /// invalid file; only later reloads degrade to keeping the old list.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Arc<Self>, ReloadError> {
        let path = path.into();
        let allowlist = read_and_parse(&path).await?;
        info!(
            path = %path.display(),
            entries = allowlist.len(),
            "allowlist loaded"
        );
        Ok(Arc::new(Self {
            path,
            current: RwLock::new(Arc::new(allowlist)),
            last_reload_error: RwLock::new(None),
        }))
    }

    /// The current complete snapshot. Cheap: one `Arc` clone under a short
    /// read lock on the per-connection hot path.
    pub fn snapshot(&self) -> Arc<Allowlist> {
        self.current.read().clone()
    }

    /// Error from the most recent reload attempt, if it failed. Cleared by
    /// the next successful reload; surfaced through `/api/health`.
    pub fn last_reload_error(&self) -> Option<String> {
        self.last_reload_error.read().clone()
    }

    /// Re-read and re-parse the file; atomic swap on success.
    pub async fn reload(&self) {
        match read_and_parse(&self.path).await {
            Ok(allowlist) => {
                let entries = allowlist.len();
                *self.current.write() = Arc::new(allowlist);
                *self.last_reload_error.write() = None;
                info!(path = %self.path.display(), entries, "allowlist reloaded");
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "allowlist reload failed, keeping previous snapshot"
                );
                *self.last_reload_error.write() = Some(e.to_string());
            }
        }
    }

    /// Watch the allowlist file (and SIGHUP on Unix) and reload on change.
    /// Runs until `shutdown` is cancelled.
    pub async fn run_watcher(self: Arc<Self>, shutdown: CancellationToken) {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(4);

        // Watch the parent directory: editors and config managers replace
        // the file by rename, which unwatches a file-level watch.
        let watch_dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = self.path.file_name().map(|n| n.to_os_string());

        let mut watcher: Option<RecommendedWatcher> = match notify::recommended_watcher(
            move |result: Result<notify::Event, notify::Error>| match result {
                Ok(event) => {
                    let relevant = file_name.as_ref().is_none_or(|name| {
                        event
                            .paths
                            .iter()
                            .any(|p| p.file_name() == Some(name.as_os_str()))
                    });
                    if relevant {
                        let _ = tx.blocking_send(());
                    }
                }
                Err(e) => warn!(error = %e, "allowlist watcher error"),
            },
        ) {
            Ok(mut w) => match w.watch(&watch_dir, RecursiveMode::NonRecursive) {
                Ok(()) => Some(w),
                Err(e) => {
                    error!(error = %e, "failed to watch allowlist directory; SIGHUP reload only");
                    None
                }
            },
            Err(e) => {
                error!(error = %e, "failed to create allowlist watcher; SIGHUP reload only");
                None
            }
        };

        #[cfg(unix)]
        let mut hangup =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(stream) => Some(stream),
                Err(e) => {
                    warn!(error = %e, "failed to install SIGHUP handler");
                    None
                }
            };

        loop {
            #[cfg(unix)]
            {
                let sighup = async {
                    match hangup.as_mut() {
                        Some(stream) => {
                            stream.recv().await;
                        }
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    Some(()) = rx.recv() => {
                        self.reload().await;
                    }
                    _ = sighup => {
                        info!("SIGHUP received, reloading allowlist");
                        self.reload().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    Some(()) = rx.recv() => {
                        self.reload().await;
                    }
                }
            }
        }

        // Keep the watcher alive until shutdown.
        drop(watcher.take());
        info!("allowlist watcher shutting down");
    }
}

async fn read_and_parse(path: &Path) -> Result<Allowlist, ReloadError> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(Allowlist::parse(&content)?)
}
