use async_trait::async_trait;
use shared_types::SessionRecord;
use sqlx::{Row, SqlitePool};

use super::backend::{PutOutcome, SessionBackend};
use super::merge::{merge_records, MergeOutcome};
use crate::error::EngineError;

/// SQLite-backed durable session store.
///
/// Schema (created on [`SqliteSessionBackend::migrate`]):
/// ```sql
/// CREATE TABLE IF NOT EXISTS decoy_sessions (
///     id          TEXT PRIMARY KEY,
///     data        TEXT NOT NULL,
///     updated_at  TEXT NOT NULL   -- RFC 3339, mirrors data.updated_at
/// );
/// ```
#[derive(Debug, Clone)]
pub struct SqliteSessionBackend {
    pool: SqlitePool,
}

impl SqliteSessionBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, EngineError> {
        let file_path = database_url.strip_prefix("sqlite:").unwrap_or(database_url);
        let path = std::path::PathBuf::from(file_path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let pool = SqlitePool::connect_with(
            sqlx::sqlite::SqliteConnectOptions::new()
                .filename(&path)
                .create_if_missing(true),
        )
        .await?;
        let backend = Self::new(pool);
        backend.migrate().await?;
        Ok(backend)
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS decoy_sessions (
                id          TEXT PRIMARY KEY,
                data        TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn decode(session_id: &str, raw: &str) -> Result<SessionRecord, EngineError> {
        serde_json::from_str(raw).map_err(|e| EngineError::CorruptPersistedState {
            key: session_id.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl SessionBackend for SqliteSessionBackend {
    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>, EngineError> {
        let row = sqlx::query("SELECT data FROM decoy_sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let raw: String = row.try_get("data")?;
                Self::decode(session_id, &raw).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn merge_put(&self, record: &SessionRecord) -> Result<PutOutcome, EngineError> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT data FROM decoy_sessions WHERE id = ?")
            .bind(&record.session_id)
            .fetch_optional(&mut *tx)
            .await?;
        let existing = match existing {
            Some(row) => {
                let raw: String = row.try_get("data")?;
                match Self::decode(&record.session_id, &raw) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        tracing::warn!(error = %e, "Stored session row unreadable; replacing");
                        None
                    }
                }
            }
            None => None,
        };

        let merged = match merge_records(existing.as_ref(), record) {
            MergeOutcome::Merged(merged) => merged,
            MergeOutcome::Stale => return Ok(PutOutcome::SkippedStale),
        };
        let data = serde_json::to_string(&merged)
            .map_err(|e| EngineError::Persistence(format!("Failed to encode session: {e}")))?;

        sqlx::query(
            "INSERT INTO decoy_sessions (id, data, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
        )
        .bind(&merged.session_id)
        .bind(&data)
        .bind(merged.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(PutOutcome::Written)
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use shared_types::IntelCategory;

    #[tokio::test]
    async fn test_sqlite_merge_put_unions_and_rejects_stale() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("sessions.db").display());
        let backend = SqliteSessionBackend::connect(&url).await.unwrap();

        let mut first = SessionRecord::new("S1", Utc::now());
        first.extracted_data.insert(IntelCategory::UpiIds, "a@ybl");
        backend.merge_put(&first).await.unwrap();

        let mut second = first.clone();
        second.extracted_data = Default::default();
        second.extracted_data.insert(IntelCategory::PhoneNumbers, "9876543210");
        second.updated_at = first.updated_at + Duration::seconds(2);
        backend.merge_put(&second).await.unwrap();

        let stored = backend.get("S1").await.unwrap().unwrap();
        assert_eq!(stored.extracted_data.total(), 2);

        let mut stale = first.clone();
        stale.updated_at = first.updated_at - Duration::seconds(10);
        stale.scam_score = 99.0;
        assert_eq!(
            backend.merge_put(&stale).await.unwrap(),
            PutOutcome::SkippedStale
        );
        assert_eq!(backend.get("S1").await.unwrap().unwrap().scam_score, 0.0);
    }
}
