//! SessionPersistActor - single durable-write authority for session records.
//!
//! Turns hand their updated record over with a fire-and-forget `Persist`
//! message. The actor keeps only the newest pending copy per session and
//! writes at most once per `interval` per session; writes that arrive inside
//! the window are deferred with a timer.

use async_trait::async_trait;
use chrono::Utc;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use shared_types::SessionRecord;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use super::backend::{PutOutcome, SharedSessionBackend};

#[derive(Debug, Default)]
pub struct SessionPersistActor;

#[derive(Clone)]
pub struct SessionPersistArguments {
    pub backend: SharedSessionBackend,
    pub interval: Duration,
}

#[derive(Debug)]
pub enum PersistMsg {
    /// Queue `record` for a durable merge-put.
    Persist { record: SessionRecord },
    /// Timer fired for a deferred session.
    FlushDue { session_id: String },
    /// Write everything pending now; replies with the number of writes.
    Flush { reply: RpcReplyPort<usize> },
    /// Newest record still waiting to be written, if any.
    Pending {
        session_id: String,
        reply: RpcReplyPort<Option<SessionRecord>>,
    },
    PendingCount { reply: RpcReplyPort<usize> },
}

pub struct SessionPersistState {
    backend: SharedSessionBackend,
    interval: Duration,
    pending: HashMap<String, SessionRecord>,
    last_written: HashMap<String, Instant>,
    scheduled: HashSet<String>,
}

const LAST_WRITTEN_SWEEP_THRESHOLD: usize = 4096;

#[async_trait]
impl Actor for SessionPersistActor {
    type Msg = PersistMsg;
    type State = SessionPersistState;
    type Arguments = SessionPersistArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            actor_id = %myself.get_id(),
            backend = args.backend.name(),
            interval_ms = args.interval.as_millis() as u64,
            "SessionPersistActor starting"
        );
        Ok(SessionPersistState {
            backend: args.backend,
            interval: args.interval,
            pending: HashMap::new(),
            last_written: HashMap::new(),
            scheduled: HashSet::new(),
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            PersistMsg::Persist { record } => {
                self.handle_persist(&myself, state, record).await;
            }
            PersistMsg::FlushDue { session_id } => {
                state.scheduled.remove(&session_id);
                if let Some(record) = state.pending.remove(&session_id) {
                    Self::write(state, record).await;
                }
            }
            PersistMsg::Flush { reply } => {
                let drained: Vec<SessionRecord> = state.pending.drain().map(|(_, r)| r).collect();
                state.scheduled.clear();
                let mut written = 0;
                for record in drained {
                    if Self::write(state, record).await {
                        written += 1;
                    }
                }
                let _ = reply.send(written);
            }
            PersistMsg::Pending { session_id, reply } => {
                let _ = reply.send(state.pending.get(&session_id).cloned());
            }
            PersistMsg::PendingCount { reply } => {
                let _ = reply.send(state.pending.len());
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let drained: Vec<SessionRecord> = state.pending.drain().map(|(_, r)| r).collect();
        if !drained.is_empty() {
            tracing::info!(
                actor_id = %myself.get_id(),
                pending = drained.len(),
                "SessionPersistActor flushing on stop"
            );
        }
        for record in drained {
            Self::write(state, record).await;
        }
        Ok(())
    }
}

impl SessionPersistActor {
    async fn handle_persist(
        &self,
        myself: &ActorRef<PersistMsg>,
        state: &mut SessionPersistState,
        record: SessionRecord,
    ) {
        let session_id = record.session_id.clone();

        // Overlapping turns may hand records over out of order.
        let newer = state
            .pending
            .get(&session_id)
            .map(|queued| record.updated_at >= queued.updated_at)
            .unwrap_or(true);
        if newer {
            state.pending.insert(session_id.clone(), record);
        }

        let now = Instant::now();
        let due_in = state
            .last_written
            .get(&session_id)
            .map(|last| state.interval.saturating_sub(now.duration_since(*last)))
            .unwrap_or(Duration::ZERO);

        if due_in.is_zero() {
            if let Some(record) = state.pending.remove(&session_id) {
                Self::write(state, record).await;
            }
        } else if state.scheduled.insert(session_id.clone()) {
            myself.send_after(due_in, move || PersistMsg::FlushDue { session_id });
        }

        if state.last_written.len() > LAST_WRITTEN_SWEEP_THRESHOLD {
            let interval = state.interval;
            state
                .last_written
                .retain(|_, last| now.duration_since(*last) < interval);
        }
    }

    /// Returns true when the record reached the backend.
    async fn write(state: &mut SessionPersistState, mut record: SessionRecord) -> bool {
        let session_id = record.session_id.clone();
        record.last_persist_at = Some(Utc::now());
        state.last_written.insert(session_id.clone(), Instant::now());

        match state.backend.merge_put(&record).await {
            Ok(PutOutcome::Written) => {
                tracing::debug!(session_id = %session_id, "Session persisted");
                true
            }
            Ok(PutOutcome::SkippedStale) => {
                tracing::debug!(session_id = %session_id, "Stale session write skipped");
                false
            }
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Session persist failed");
                false
            }
        }
    }
}
