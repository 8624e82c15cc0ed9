//! Audit sinks. Hash-chaining and tamper evidence happen downstream; the
//! engine only emits one record per decision with content fingerprints.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use shared_types::AuditRecord;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::AuditSink;
use crate::error::EngineError;

/// Hex SHA-256 of `content`.
pub fn fingerprint(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Emits records as structured tracing events on the `decoy_engine::audit`
/// target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn emit(&self, record: &AuditRecord) -> Result<(), EngineError> {
        tracing::info!(
            target: "decoy_engine::audit",
            session_id = %record.session_id,
            turn = record.turn,
            actor = %record.actor,
            decision = %record.decision,
            confidence = record.confidence,
            input_fingerprint = %record.input_fingerprint,
            output_fingerprint = %record.output_fingerprint,
            reasoning = %record.reasoning,
            "audit"
        );
        Ok(())
    }
}

/// Appends one JSON object per line.
#[derive(Debug)]
pub struct JsonlAuditSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlAuditSink {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn emit(&self, record: &AuditRecord) -> Result<(), EngineError> {
        let mut line = serde_json::to_vec(record)
            .map_err(|e| EngineError::Persistence(format!("Failed to encode audit record: {e}")))?;
        line.push(b'\n');

        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}
