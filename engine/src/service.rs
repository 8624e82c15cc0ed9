//! Turn entry point: lock → load → pipeline → learn → save → audit.

use anyhow::Context;
use shared_types::{
    DecisionRecord, PreviousTurn, SafetyVerdict, SelectionPath, SessionRecord, Tactic,
    TurnRequest, TurnResponse,
};
use std::sync::Arc;
use std::time::Duration;

use crate::collaborators::{
    Collaborators, JsonlAuditSink, OpenAiCompatClient, SharedAuditSink, TracingAuditSink,
};
use crate::config::{EngineConfig, SessionBackendKind};
use crate::error::EngineError;
use crate::payoff::PayoffModel;
use crate::pipeline::{degraded_reply, Orchestrator, PipelineSettings, TurnOutcome};
use crate::policy::{JsonLearningRepository, SharedTacticPolicy, StateKey, TacticPolicy};
use crate::session::{
    normalize_session_id, JsonFileSessionBackend, SessionStore, SessionStoreLimits,
    SharedSessionBackend, SharedSessionStore, SqliteSessionBackend,
};

/// Reward per newly confirmed identifier.
pub const INTEL_REWARD: f64 = 10.0;
/// Reward for keeping the counterpart engaged one more turn.
pub const ENGAGEMENT_REWARD: f64 = 0.5;
pub const DEFENSIVE_PENALTY: f64 = 2.0;
/// Incoming history longer than this is cut when seeding a new session.
const SEED_HISTORY_LIMIT: usize = 80;

/// Delayed reward for the action taken at `previous`, observed now.
///
/// `current` is the tactic this turn ended up with; being forced into a
/// defensive override costs the previous action.
pub fn turn_reward(previous: &PreviousTurn, confirmed_now: usize, current: Tactic) -> f64 {
    let new_intel = confirmed_now.saturating_sub(previous.intel_count) as f64;
    let penalty = if current.is_defensive_override() {
        DEFENSIVE_PENALTY
    } else {
        0.0
    };
    INTEL_REWARD * new_intel + ENGAGEMENT_REWARD - penalty
}

/// Q-update target: the turn reward plus its economic share.
pub fn q_reward(reward: f64) -> f64 {
    reward + reward / 350.0 * 10.0
}

pub struct DecoyEngine {
    store: SharedSessionStore,
    orchestrator: Orchestrator,
    audit: SharedAuditSink,
    lock_timeout: Duration,
}

pub type SharedDecoyEngine = Arc<DecoyEngine>;

impl DecoyEngine {
    pub fn new(
        store: SharedSessionStore,
        orchestrator: Orchestrator,
        audit: SharedAuditSink,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            store,
            orchestrator,
            audit,
            lock_timeout,
        }
    }

    /// Wire every component from `config`.
    pub async fn bootstrap(config: &EngineConfig) -> anyhow::Result<Self> {
        let backend: SharedSessionBackend = match config.session_backend {
            SessionBackendKind::Json => Arc::new(
                JsonFileSessionBackend::open(config.sessions_dir())
                    .await
                    .context("Failed to open session directory")?,
            ),
            SessionBackendKind::Sqlite => Arc::new(
                SqliteSessionBackend::connect(&config.database_url)
                    .await
                    .context("Failed to open session database")?,
            ),
        };
        let store = SessionStore::start(
            backend,
            SessionStoreLimits {
                cache_capacity: config.session_cache_capacity,
                lock_capacity: config.lock_table_capacity,
                persist_interval: config.persist_interval,
            },
        )
        .await
        .context("Failed to start session store")?;

        let repository = JsonLearningRepository::open(config.learning_dir())
            .await
            .context("Failed to open learning directory")?;
        let policy = Arc::new(TacticPolicy::load(Arc::new(repository)).await);

        let collaborators = match &config.llm {
            Some(llm) => {
                tracing::info!(
                    model = %llm.model,
                    api_base = %llm.api_base,
                    "Using remote model collaborators"
                );
                let client = OpenAiCompatClient::new(llm.clone(), config.collaborator_timeout)
                    .context("Failed to build model client")?;
                Collaborators::with_model(Arc::new(client))
            }
            None => {
                tracing::info!("No LLM_API_KEY set; using local collaborators");
                Collaborators::local()
            }
        };

        let audit: SharedAuditSink = match &config.audit_log {
            Some(path) => Arc::new(
                JsonlAuditSink::open(path.clone())
                    .await
                    .context("Failed to open audit log")?,
            ),
            None => Arc::new(TracingAuditSink),
        };

        let orchestrator = Orchestrator::new(
            collaborators,
            policy,
            PayoffModel::new(config.solver_timeout),
            PipelineSettings::from_config(config),
        );
        Ok(Self::new(
            Arc::new(store),
            orchestrator,
            audit,
            config.lock_timeout,
        ))
    }

    pub fn store(&self) -> &SharedSessionStore {
        &self.store
    }

    pub fn policy(&self) -> &SharedTacticPolicy {
        self.orchestrator.policy()
    }

    /// Current record for `session_id`, from cache or durable storage.
    pub async fn session(&self, session_id: &str) -> Result<Option<SessionRecord>, EngineError> {
        let session_id = normalize_session_id(session_id);
        if let Some(record) = self.store.peek(&session_id) {
            return Ok(Some(record));
        }
        self.store.backend().get(&session_id).await
    }

    pub async fn handle_turn(&self, request: TurnRequest) -> TurnResponse {
        let session_id = normalize_session_id(&request.session_id);

        let guard = match self.store.acquire(&session_id, self.lock_timeout).await {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!(
                    session_id = %session_id,
                    error = %e,
                    "Session busy; degraded reply"
                );
                return self.contention_response(session_id, &e);
            }
        };

        let mut record = self.store.load(&session_id).await;
        if record.turn_count == 0 && record.history.is_empty() {
            let skip = request
                .conversation_history
                .len()
                .saturating_sub(SEED_HISTORY_LIMIT);
            record.history = request.conversation_history[skip..].to_vec();
        }

        let previous = record.previous_turn.clone();
        let mut outcome = self.orchestrator.run(record, &request.message).await;
        self.learn(previous.as_ref(), &mut outcome).await;
        self.store.save(outcome.record.clone());
        drop(guard);

        for audit in &outcome.audits {
            if let Err(e) = self.audit.emit(audit).await {
                tracing::warn!(
                    session_id = %session_id,
                    actor = %audit.actor,
                    error = %e,
                    "Audit emit failed"
                );
            }
        }

        tracing::info!(
            session_id = %session_id,
            turn = outcome.decision.turn,
            tactic = %outcome.decision.tactic,
            path = %outcome.decision.selection_path,
            degraded = outcome.degraded,
            "Turn complete"
        );
        build_response(session_id, outcome)
    }

    /// Reward the previous decision and remember this one. Reflex and
    /// fallback turns leave the learning trail untouched.
    async fn learn(&self, previous: Option<&PreviousTurn>, outcome: &mut TurnOutcome) {
        if matches!(
            outcome.decision.selection_path,
            SelectionPath::Reflex | SelectionPath::PipelineFallback
        ) {
            return;
        }

        let policy = self.orchestrator.policy();
        let current_key = StateKey::from(outcome.decision.state_key.as_str());
        let confirmed_now = outcome.record.confirmed_intel_count();

        if let Some(previous) = previous.filter(|p| p.action.is_learnable()) {
            let reward = turn_reward(previous, confirmed_now, outcome.decision.tactic);
            let previous_key = StateKey::from(previous.state_key.as_str());
            policy.update_q(&previous_key, previous.action, q_reward(reward), &current_key);
            if let Err(e) = policy
                .record_feedback(&previous_key, previous.action, reward)
                .await
            {
                tracing::error!(
                    session_id = %outcome.record.session_id,
                    state_key = %previous_key,
                    error = %e,
                    "Bandit feedback not persisted"
                );
                outcome.decision.faults.push(e.fault_tag());
            }
            outcome.decision.reward = Some(reward);
        }

        outcome.record.previous_turn = Some(PreviousTurn {
            turn: outcome.decision.turn,
            scam_score: outcome.record.scam_score,
            action: outcome.decision.tactic,
            state_key: outcome.decision.state_key.clone(),
            intel_count: confirmed_now,
        });
    }

    fn contention_response(&self, session_id: String, error: &EngineError) -> TurnResponse {
        let cached = self.store.peek(&session_id);
        let turn = cached.as_ref().map(|r| r.turn_count).unwrap_or(0);
        let reply = degraded_reply(turn as usize).to_string();
        let decision = DecisionRecord {
            decision_id: ulid::Ulid::new().to_string(),
            turn,
            state_key: String::new(),
            tactic: Tactic::SafeFallback,
            selection_path: SelectionPath::LockContention,
            confidence: 0.0,
            reasoning: "session busy".to_string(),
            payoff: None,
            safety: SafetyVerdict::Approved,
            predicted_move: None,
            reward: None,
            faults: vec![error.fault_tag()],
        };
        let record = cached.unwrap_or_else(|| SessionRecord::new(&session_id, chrono::Utc::now()));
        TurnResponse {
            status: "success".to_string(),
            session_id,
            typing_delay_ms: crate::pipeline::heuristics::typing_delay_ms(
                &reply,
                &mut rand::rng(),
            ),
            reply,
            tactic: Tactic::SafeFallback,
            degraded: true,
            scam_score: record.scam_score,
            scam_type: record.scam_type,
            patience_meter: record.patience_meter,
            extracted_intelligence: record.extracted_data,
            decision,
        }
    }

    /// Persist every pending session and checkpoint the learning tables.
    pub async fn shutdown(&self) {
        match self.store.flush().await {
            Ok(written) => tracing::info!(written, "Sessions flushed"),
            Err(e) => tracing::error!(error = %e, "Session flush failed"),
        }
        if let Err(e) = self.policy().checkpoint().await {
            tracing::error!(error = %e, "Final learning checkpoint failed");
        }
    }
}

fn build_response(session_id: String, outcome: TurnOutcome) -> TurnResponse {
    let record = outcome.record;
    TurnResponse {
        status: "success".to_string(),
        session_id,
        reply: outcome.reply,
        tactic: outcome.decision.tactic,
        degraded: outcome.degraded,
        typing_delay_ms: outcome.typing_delay_ms,
        scam_score: record.scam_score,
        scam_type: record.scam_type,
        patience_meter: record.patience_meter,
        extracted_intelligence: record.extracted_data,
        decision: outcome.decision,
    }
}
