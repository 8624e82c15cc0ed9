//! Durable session store boundary.

use async_trait::async_trait;
use dashmap::DashMap;
use shared_types::SessionRecord;
use std::sync::Arc;

use super::merge::{merge_records, MergeOutcome};
use crate::error::EngineError;

pub type SharedSessionBackend = Arc<dyn SessionBackend>;

/// Result of a merge-put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    SkippedStale,
}

#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Stored record, `None` when unseen. Unreadable records surface as
    /// [`EngineError::CorruptPersistedState`].
    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>, EngineError>;

    /// Merge `record` into whatever is stored and write the result atomically.
    async fn merge_put(&self, record: &SessionRecord) -> Result<PutOutcome, EngineError>;

    fn name(&self) -> &'static str;
}

/// Process-local backend for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemorySessionBackend {
    records: DashMap<String, SessionRecord>,
}

impl MemorySessionBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl SessionBackend for MemorySessionBackend {
    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>, EngineError> {
        Ok(self.records.get(session_id).map(|r| r.value().clone()))
    }

    async fn merge_put(&self, record: &SessionRecord) -> Result<PutOutcome, EngineError> {
        let mut entry = self
            .records
            .entry(record.session_id.clone())
            .or_insert_with(|| record.clone());
        match merge_records(Some(entry.value()), record) {
            MergeOutcome::Merged(merged) => {
                *entry.value_mut() = merged;
                Ok(PutOutcome::Written)
            }
            MergeOutcome::Stale => Ok(PutOutcome::SkippedStale),
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
