//! Session state: bounded cache, per-session locks and durable merge-on-write
//! persistence.
//!
//! Reads prefer the in-memory cache, then a record still queued for
//! persistence, then the durable backend. Writes update the cache
//! synchronously and hand the record to [`SessionPersistActor`] without
//! waiting for the disk.

pub mod backend;
pub mod cache;
pub mod json_file;
pub mod locks;
pub mod merge;
pub mod persist;
pub mod sqlite;

use chrono::Utc;
use ractor::{Actor, ActorRef};
use shared_types::SessionRecord;
use std::sync::Arc;
use std::time::Duration;

pub use backend::{MemorySessionBackend, PutOutcome, SessionBackend, SharedSessionBackend};
pub use cache::BoundedCache;
pub use json_file::JsonFileSessionBackend;
pub use locks::{SessionGuard, SessionLocks};
pub use merge::{merge_records, MergeOutcome};
pub use persist::{PersistMsg, SessionPersistActor, SessionPersistArguments};
pub use sqlite::SqliteSessionBackend;

use crate::error::EngineError;

/// Ids shorter than this are folded into a shared `"unknown"` session.
const MIN_SESSION_ID_LEN: usize = 2;

pub fn normalize_session_id(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.chars().count() < MIN_SESSION_ID_LEN {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionStoreLimits {
    pub cache_capacity: usize,
    pub lock_capacity: usize,
    pub persist_interval: Duration,
}

pub struct SessionStore {
    cache: BoundedCache<String, SessionRecord>,
    locks: SessionLocks,
    backend: SharedSessionBackend,
    persister: ActorRef<PersistMsg>,
}

pub type SharedSessionStore = Arc<SessionStore>;

impl SessionStore {
    pub async fn start(
        backend: SharedSessionBackend,
        limits: SessionStoreLimits,
    ) -> Result<Self, EngineError> {
        let (persister, _handle) = Actor::spawn(
            None,
            SessionPersistActor,
            SessionPersistArguments {
                backend: backend.clone(),
                interval: limits.persist_interval,
            },
        )
        .await
        .map_err(|e| EngineError::Persistence(format!("Failed to spawn persister: {e}")))?;

        Ok(Self {
            cache: BoundedCache::new(limits.cache_capacity),
            locks: SessionLocks::new(limits.lock_capacity),
            backend,
            persister,
        })
    }

    pub async fn acquire(
        &self,
        session_id: &str,
        timeout: Duration,
    ) -> Result<SessionGuard, EngineError> {
        self.locks.acquire(session_id, timeout).await
    }

    /// Current record, or an empty one for an unseen id. Never fails: an
    /// unreadable durable record is logged and treated as empty.
    pub async fn load(&self, session_id: &str) -> SessionRecord {
        if let Some(record) = self.cache.get(&session_id.to_string()) {
            return record;
        }

        let pending = ractor::call!(self.persister, |reply| PersistMsg::Pending {
            session_id: session_id.to_string(),
            reply,
        });
        if let Ok(Some(record)) = pending {
            self.cache.insert(session_id.to_string(), record.clone());
            return record;
        }

        let loaded = match self.backend.get(session_id).await {
            Ok(Some(record)) => record,
            Ok(None) => SessionRecord::new(session_id, Utc::now()),
            Err(e) => {
                tracing::warn!(
                    session_id = %session_id,
                    backend = self.backend.name(),
                    error = %e,
                    "Durable session unreadable; starting from empty record"
                );
                SessionRecord::new(session_id, Utc::now())
            }
        };
        self.cache.insert(session_id.to_string(), loaded.clone());
        loaded
    }

    /// Cached copy only; does not touch durable storage.
    pub fn peek(&self, session_id: &str) -> Option<SessionRecord> {
        self.cache.get(&session_id.to_string())
    }

    /// Update the cache and schedule a durable write.
    pub fn save(&self, record: SessionRecord) {
        self.cache
            .insert(record.session_id.clone(), record.clone());
        if let Err(e) = self.persister.send_message(PersistMsg::Persist { record }) {
            tracing::error!(error = %e, "Failed to hand session to persister");
        }
    }

    /// Write every pending record now. Returns the number written.
    pub async fn flush(&self) -> Result<usize, EngineError> {
        ractor::call!(self.persister, |reply| PersistMsg::Flush { reply })
            .map_err(|e| EngineError::Persistence(format!("Flush request failed: {e}")))
    }

    /// Sessions saved but not yet durably written.
    pub async fn pending_writes(&self) -> Result<usize, EngineError> {
        ractor::call!(self.persister, |reply| PersistMsg::PendingCount { reply })
            .map_err(|e| EngineError::Persistence(format!("Pending count request failed: {e}")))
    }

    pub fn backend(&self) -> &SharedSessionBackend {
        &self.backend
    }

    pub fn cached_sessions(&self) -> usize {
        self.cache.len()
    }

    pub fn lock_table_len(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        self.persister.stop(None);
    }
}
