// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Audit Logger
//!
//! Append-only NDJSON sink for [`AuditLogEntry`] records. One serialized
//! object per line; a single mutex-held writer guarantees concurrent appends
//! never interleave partial records.
//!
//! Ordering contract: `append` completes (buffered and flushed) before the
//! caller sends its response, so a client can never observe a successful
//! operation that lacks an audit record.

use std::path::Path;

use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::warn;

use crate::domain::audit::AuditLogEntry;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("failed to open audit log {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to append audit record: {0}")]
    Write(#[from] std::io::Error),

    #[error("failed to serialize audit record: {0}")]
    Serialize(#[from] serde_json::Error),
}

enum Sink {
    File(BufWriter<File>),
    Stdout,
}

pub struct AuditLogger {
    sink: Mutex<Sink>,
}

impl AuditLogger {
    /// Open (appending) or create the audit log file.
    pub async fn to_file(path: &Path) -> Result<Self, AuditError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|source| AuditError::Open {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self {
            sink: Mutex::new(Sink::File(BufWriter::new(file))),
        })
    }

    /// NDJSON to stdout, for log-collector deployments.
    pub fn to_stdout() -> Self {
        Self {
            sink: Mutex::new(Sink::Stdout),
        }
    }

    /// Append one record. Holds the writer for the whole line so records
    /// from concurrent requests never interleave.
    pub async fn append(&self, entry: &AuditLogEntry) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut sink = self.sink.lock().await;
        match &mut *sink {
            Sink::File(writer) => {
                writer.write_all(&line).await?;
                writer.flush().await?;
            }
            Sink::Stdout => {
                let mut stdout = tokio::io::stdout();
                stdout.write_all(&line).await?;
                stdout.flush().await?;
            }
        }
        Ok(())
    }

    /// Append, logging (rather than propagating) sink failures. Used on
    /// paths where the policy decision already happened and the response
    /// must still reach the client; the failure is loudly visible in the
    /// process log either way.
    pub async fn append_best_effort(&self, entry: &AuditLogEntry) {
        if let Err(e) = self.append(entry).await {
            warn!(error = %e, operation = entry.operation_kind.as_str(), "audit append failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::audit::Outcome;
    use crate::domain::policy::{DecisionRecord, PolicyDecision};
    use crate::domain::request::OperationKind;

    fn entry(host: &str) -> AuditLogEntry {
        AuditLogEntry::new(
            "10.77.0.2:40000",
            OperationKind::ProxyConnect,
            serde_json::json!({"host": host}),
            DecisionRecord::from(&PolicyDecision::Allow),
            Outcome::Success,
            1,
        )
    }

    #[tokio::test]
    async fn appends_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.ndjson");
        let logger = AuditLogger::to_file(&path).await.unwrap();

        logger.append(&entry("github.com")).await.unwrap();
        logger.append(&entry("api.anthropic.com")).await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let parsed: AuditLogEntry = serde_json::from_str(line).unwrap();
            assert_eq!(parsed.operation_kind, OperationKind::ProxyConnect);
        }
    }

    #[tokio::test]
    async fn concurrent_appends_never_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.ndjson");
        let logger = std::sync::Arc::new(AuditLogger::to_file(&path).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..32 {
            let logger = logger.clone();
            handles.push(tokio::spawn(async move {
                logger.append(&entry(&format!("host-{i}.example"))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let mut seen = 0;
        for line in content.lines() {
            serde_json::from_str::<AuditLogEntry>(line).expect("each line is complete JSON");
            seen += 1;
        }
        assert_eq!(seen, 32);
    }
}
