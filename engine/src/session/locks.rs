//! Per-session exclusion.
//!
//! One async mutex per session id, held for the whole turn. Acquisition is
//! bounded; a caller that times out must answer with a degraded reply instead
//! of queueing.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::cache::BoundedCache;
use crate::error::EngineError;

type SessionMutex = Arc<Mutex<()>>;

/// Proof that the current task owns its session for the rest of the turn.
#[derive(Debug)]
pub struct SessionGuard {
    session_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl SessionGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[derive(Debug)]
pub struct SessionLocks {
    table: BoundedCache<String, SessionMutex>,
}

impl SessionLocks {
    pub fn new(capacity: usize) -> Self {
        Self {
            table: BoundedCache::new(capacity),
        }
    }

    pub async fn acquire(
        &self,
        session_id: &str,
        timeout: Duration,
    ) -> Result<SessionGuard, EngineError> {
        // Only locks nobody holds or waits on may be evicted; the table's own
        // reference is the single strong count in that case.
        let lock = self.table.get_or_insert_with(
            session_id.to_string(),
            || Arc::new(Mutex::new(())),
            |lock| Arc::strong_count(lock) == 1,
        );

        match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => Ok(SessionGuard {
                session_id: session_id.to_string(),
                _guard: guard,
            }),
            Err(_) => {
                tracing::debug!(session_id = %session_id, waited_ms = timeout.as_millis() as u64, "Session lock contended");
                Err(EngineError::LockTimeout {
                    session_id: session_id.to_string(),
                    waited: timeout,
                })
            }
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_acquire_times_out_while_held() {
        let locks = SessionLocks::new(16);
        let guard = locks
            .acquire("S1", Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(guard.session_id(), "S1");

        let contended = locks.acquire("S1", Duration::from_millis(30)).await;
        assert!(matches!(contended, Err(EngineError::LockTimeout { .. })));

        // Other sessions are unaffected.
        assert!(locks.acquire("S2", Duration::from_millis(30)).await.is_ok());

        drop(guard);
        assert!(locks.acquire("S1", Duration::from_millis(30)).await.is_ok());
    }

    #[tokio::test]
    async fn test_held_lock_is_never_evicted() {
        let locks = SessionLocks::new(1);
        let guard = locks
            .acquire("held", Duration::from_millis(50))
            .await
            .unwrap();
        let _other = locks
            .acquire("other", Duration::from_millis(50))
            .await
            .unwrap();

        // A fresh mutex for "held" would let this succeed; it must not.
        let again = locks.acquire("held", Duration::from_millis(20)).await;
        assert!(again.is_err());
        drop(guard);
    }
}
