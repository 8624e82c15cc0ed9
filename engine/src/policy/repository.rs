//! Durable home of the learning tables.
//!
//! Snapshots are whole-table checkpoints. Bandit feedback is written through
//! as one appended line per update and folded into the next snapshot, so no
//! single update rewrites the full table.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared_types::Tactic;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::tables::{BanditCounts, LearningSnapshot};
use crate::error::EngineError;
use crate::session::json_file::write_atomic;

pub type SharedLearningRepository = Arc<dyn LearningRepository>;

/// Absolute counter state after one feedback update. Replaying lines in
/// order reproduces the tables; replaying a line twice is harmless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub state_key: String,
    pub action: Tactic,
    pub counts: BanditCounts,
}

#[async_trait]
pub trait LearningRepository: Send + Sync {
    async fn load(&self) -> Result<LearningSnapshot, EngineError>;
    async fn store_snapshot(&self, snapshot: &LearningSnapshot) -> Result<(), EngineError>;
    async fn store_feedback(&self, entry: &FeedbackEntry) -> Result<(), EngineError>;
}

// ============================================================================
// JSON files
// ============================================================================

const Q_TABLE_FILE: &str = "q_table.json";
const BANDIT_FILE: &str = "bandit_stats.json";
const FEEDBACK_LOG_FILE: &str = "bandit_feedback.jsonl";

#[derive(Debug)]
pub struct JsonLearningRepository {
    root: PathBuf,
    log_lock: Mutex<()>,
}

impl JsonLearningRepository {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            log_lock: Mutex::new(()),
        })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    async fn read_json<T>(path: &Path) -> Result<T, EngineError>
    where
        T: Default + for<'de> Deserialize<'de>,
    {
        match fs::read_to_string(path).await {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| EngineError::CorruptPersistedState {
                key: path.display().to_string(),
                message: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Unreadable snapshot files start the table empty instead of failing.
    async fn read_or_empty<T>(path: &Path) -> T
    where
        T: Default + for<'de> Deserialize<'de>,
    {
        Self::read_json(path).await.unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "Learning snapshot unreadable; starting empty");
            T::default()
        })
    }
}

#[async_trait]
impl LearningRepository for JsonLearningRepository {
    async fn load(&self) -> Result<LearningSnapshot, EngineError> {
        let mut snapshot = LearningSnapshot {
            q_table: Self::read_or_empty(&self.path(Q_TABLE_FILE)).await,
            bandit_stats: Self::read_or_empty(&self.path(BANDIT_FILE)).await,
        };

        let log = match fs::read_to_string(self.path(FEEDBACK_LOG_FILE)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let mut skipped = 0usize;
        for line in log.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<FeedbackEntry>(line) {
                Ok(entry) => {
                    snapshot
                        .bandit_stats
                        .entry(entry.state_key)
                        .or_default()
                        .insert(entry.action, entry.counts);
                }
                // A crash mid-append leaves at most a torn final line.
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            tracing::warn!(skipped, "Ignored unreadable feedback log lines");
        }
        Ok(snapshot)
    }

    async fn store_snapshot(&self, snapshot: &LearningSnapshot) -> Result<(), EngineError> {
        let q_raw = serde_json::to_vec_pretty(&snapshot.q_table)
            .map_err(|e| EngineError::Persistence(format!("Failed to encode q table: {e}")))?;
        let bandit_raw = serde_json::to_vec_pretty(&snapshot.bandit_stats)
            .map_err(|e| EngineError::Persistence(format!("Failed to encode bandit stats: {e}")))?;

        let _guard = self.log_lock.lock().await;
        write_atomic(&self.path(Q_TABLE_FILE), &q_raw).await?;
        write_atomic(&self.path(BANDIT_FILE), &bandit_raw).await?;
        // Everything in the log is now folded into bandit_stats.json.
        write_atomic(&self.path(FEEDBACK_LOG_FILE), b"").await?;
        Ok(())
    }

    async fn store_feedback(&self, entry: &FeedbackEntry) -> Result<(), EngineError> {
        let mut line = serde_json::to_vec(entry)
            .map_err(|e| EngineError::Persistence(format!("Failed to encode feedback: {e}")))?;
        line.push(b'\n');

        let _guard = self.log_lock.lock().await;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(FEEDBACK_LOG_FILE))
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(())
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Debug, Default)]
pub struct InMemoryLearningRepository {
    snapshot: std::sync::Mutex<LearningSnapshot>,
    feedback: std::sync::Mutex<Vec<FeedbackEntry>>,
}

impl InMemoryLearningRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: LearningSnapshot) -> Self {
        Self {
            snapshot: std::sync::Mutex::new(snapshot),
            feedback: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn feedback_entries(&self) -> Vec<FeedbackEntry> {
        self.feedback
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    pub fn stored_snapshot(&self) -> LearningSnapshot {
        self.snapshot
            .lock()
            .map(|snapshot| snapshot.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LearningRepository for InMemoryLearningRepository {
    async fn load(&self) -> Result<LearningSnapshot, EngineError> {
        let mut snapshot = self.stored_snapshot();
        for entry in self.feedback_entries() {
            snapshot
                .bandit_stats
                .entry(entry.state_key)
                .or_default()
                .insert(entry.action, entry.counts);
        }
        Ok(snapshot)
    }

    async fn store_snapshot(&self, snapshot: &LearningSnapshot) -> Result<(), EngineError> {
        let mut stored = self
            .snapshot
            .lock()
            .map_err(|_| EngineError::Persistence("snapshot lock poisoned".into()))?;
        *stored = snapshot.clone();
        if let Ok(mut feedback) = self.feedback.lock() {
            feedback.clear();
        }
        Ok(())
    }

    async fn store_feedback(&self, entry: &FeedbackEntry) -> Result<(), EngineError> {
        self.feedback
            .lock()
            .map_err(|_| EngineError::Persistence("feedback lock poisoned".into()))?
            .push(entry.clone());
        Ok(())
    }
}
