//! One JSON document per session, written with temp + rename.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use shared_types::SessionRecord;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

use super::backend::{PutOutcome, SessionBackend};
use super::merge::{merge_records, MergeOutcome};
use crate::error::EngineError;

#[derive(Debug)]
pub struct JsonFileSessionBackend {
    root: PathBuf,
    // Serializes read-merge-write cycles so two writers cannot interleave.
    write_lock: Mutex<()>,
}

impl JsonFileSessionBackend {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{}.json", file_stem(session_id)))
    }

    async fn read(&self, path: &Path, session_id: &str) -> Result<Option<SessionRecord>, EngineError> {
        let raw = match fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(EngineError::CorruptPersistedState {
                    key: session_id.to_string(),
                    message: e.to_string(),
                })
            }
        };
        serde_json::from_str::<SessionRecord>(&raw)
            .map(Some)
            .map_err(|e| EngineError::CorruptPersistedState {
                key: session_id.to_string(),
                message: e.to_string(),
            })
    }
}

/// Filesystem-safe stem. Ids that needed rewriting get a digest suffix so two
/// different ids never share a file.
fn file_stem(session_id: &str) -> String {
    let sanitized: String = session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(96)
        .collect();
    if sanitized == session_id {
        return sanitized;
    }
    let digest = Sha256::digest(session_id.as_bytes());
    format!("{sanitized}-{}", hex::encode(&digest[..6]))
}

pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), EngineError> {
    let temp_path = path.with_extension(format!("tmp-{}", ulid::Ulid::new()));
    fs::write(&temp_path, contents)
        .await
        .map_err(|e| EngineError::Persistence(format!("Failed to write temp file: {e}")))?;
    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(EngineError::Persistence(format!(
            "Failed to rename {}: {e}",
            temp_path.display()
        )));
    }
    Ok(())
}

#[async_trait]
impl SessionBackend for JsonFileSessionBackend {
    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>, EngineError> {
        self.read(&self.path_for(session_id), session_id).await
    }

    async fn merge_put(&self, record: &SessionRecord) -> Result<PutOutcome, EngineError> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(&record.session_id);

        let existing = match self.read(&path, &record.session_id).await {
            Ok(existing) => existing,
            Err(e) => {
                tracing::warn!(
                    session_id = %record.session_id,
                    error = %e,
                    "Stored session unreadable; overwriting with incoming record"
                );
                None
            }
        };

        let merged = match merge_records(existing.as_ref(), record) {
            MergeOutcome::Merged(merged) => merged,
            MergeOutcome::Stale => {
                tracing::debug!(session_id = %record.session_id, "Skipping stale session write");
                return Ok(PutOutcome::SkippedStale);
            }
        };

        let raw = serde_json::to_vec_pretty(&merged)
            .map_err(|e| EngineError::Persistence(format!("Failed to encode session: {e}")))?;
        write_atomic(&path, &raw).await?;
        Ok(PutOutcome::Written)
    }

    fn name(&self) -> &'static str {
        "json"
    }
}
