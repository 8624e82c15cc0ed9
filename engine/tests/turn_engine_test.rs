//! End-to-end turn handling through `DecoyEngine`

use async_trait::async_trait;
use chrono::Utc;
use shared_types::{
    ExtractedIntel, IntelCategory, SelectionPath, SessionRecord, Tactic, TurnRequest,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use decoy_engine::collaborators::{
    AdjudicationRequest, Adjudicator, Collaborators, Extractor, Proposal, ProposalError, Renderer,
    Situation, TextGenerator, TracingAuditSink, Verifier,
};
use decoy_engine::config::PolicyMode;
use decoy_engine::error::EngineError;
use decoy_engine::payoff::PayoffModel;
use decoy_engine::pipeline::{Orchestrator, PipelineSettings};
use decoy_engine::policy::TacticPolicy;
use decoy_engine::session::{
    MemorySessionBackend, SessionBackend, SessionStore, SessionStoreLimits,
};
use decoy_engine::DecoyEngine;

// ============================================================================
// Collaborator doubles
// ============================================================================

#[derive(Default)]
struct Broken;

#[async_trait]
impl Extractor for Broken {
    async fn extract(&self, _text: &str) -> Result<ExtractedIntel, EngineError> {
        Err(EngineError::CollaboratorError {
            collaborator: "extractor",
            message: "connection refused".into(),
        })
    }
    fn name(&self) -> &'static str {
        "broken"
    }
}

#[async_trait]
impl Verifier for Broken {
    async fn verify(
        &self,
        _candidates: &ExtractedIntel,
        _context: &str,
    ) -> Result<ExtractedIntel, EngineError> {
        Err(EngineError::CollaboratorError {
            collaborator: "verifier",
            message: "connection refused".into(),
        })
    }
    fn name(&self) -> &'static str {
        "broken"
    }
}

#[async_trait]
impl TextGenerator for Broken {
    async fn propose(&self, _situation: &Situation) -> Result<Proposal, ProposalError> {
        Err(ProposalError::Unparsable("<html>502</html>".into()))
    }
    fn name(&self) -> &'static str {
        "broken"
    }
}

#[async_trait]
impl Renderer for Broken {
    async fn render(&self, _draft: &str, _persona: &str) -> Result<String, EngineError> {
        Err(EngineError::CollaboratorError {
            collaborator: "renderer",
            message: "connection refused".into(),
        })
    }
    fn name(&self) -> &'static str {
        "broken"
    }
}

#[async_trait]
impl Adjudicator for Broken {
    async fn adjudicate(&self, _request: &AdjudicationRequest) -> Result<String, EngineError> {
        Err(EngineError::CollaboratorError {
            collaborator: "adjudicator",
            message: "connection refused".into(),
        })
    }
    fn name(&self) -> &'static str {
        "broken"
    }
}

/// Sleeps far past any timeout the tests configure.
struct Stuck;

const STUCK_FOR: Duration = Duration::from_secs(30);

#[async_trait]
impl TextGenerator for Stuck {
    async fn propose(&self, _situation: &Situation) -> Result<Proposal, ProposalError> {
        tokio::time::sleep(STUCK_FOR).await;
        Err(ProposalError::Timeout)
    }
    fn name(&self) -> &'static str {
        "stuck"
    }
}

#[async_trait]
impl Renderer for Stuck {
    async fn render(&self, draft: &str, _persona: &str) -> Result<String, EngineError> {
        tokio::time::sleep(STUCK_FOR).await;
        Ok(draft.to_string())
    }
    fn name(&self) -> &'static str {
        "stuck"
    }
}

#[async_trait]
impl Adjudicator for Stuck {
    async fn adjudicate(&self, _request: &AdjudicationRequest) -> Result<String, EngineError> {
        tokio::time::sleep(STUCK_FOR).await;
        Ok("APPROVED".into())
    }
    fn name(&self) -> &'static str {
        "stuck"
    }
}

/// Generator that names a fixed reply and counts its calls.
struct Scripted {
    reply: &'static str,
    calls: AtomicUsize,
}

#[async_trait]
impl TextGenerator for Scripted {
    async fn propose(&self, situation: &Situation) -> Result<Proposal, ProposalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Proposal {
            tactic_name: situation.tactic.to_string(),
            confidence: 0.8,
            reasoning: "scripted".into(),
            reply_text: self.reply.to_string(),
        })
    }
    fn name(&self) -> &'static str {
        "scripted"
    }
}

// ============================================================================
// Setup
// ============================================================================

fn settings() -> PipelineSettings {
    PipelineSettings {
        collaborator_timeout: Duration::from_millis(200),
        turn_budget: Duration::from_millis(800),
        history_limit: 120,
        policy_mode: PolicyMode::Hybrid,
        intel_value_inr: 500.0,
    }
}

async fn setup_engine(
    collaborators: Collaborators,
    settings: PipelineSettings,
    lock_timeout: Duration,
) -> (DecoyEngine, Arc<MemorySessionBackend>) {
    let backend = Arc::new(MemorySessionBackend::new());
    let store = SessionStore::start(
        backend.clone(),
        SessionStoreLimits {
            cache_capacity: 64,
            lock_capacity: 64,
            persist_interval: Duration::from_millis(10),
        },
    )
    .await
    .expect("failed to start session store");

    let orchestrator = Orchestrator::new(
        collaborators,
        Arc::new(TacticPolicy::seeded(42)),
        PayoffModel::new(Duration::from_millis(500)),
        settings,
    );
    let engine = DecoyEngine::new(
        Arc::new(store),
        orchestrator,
        Arc::new(TracingAuditSink),
        lock_timeout,
    );
    (engine, backend)
}

async fn local_engine() -> (DecoyEngine, Arc<MemorySessionBackend>) {
    setup_engine(Collaborators::local(), settings(), Duration::from_secs(5)).await
}

fn request(session_id: &str, message: &str) -> TurnRequest {
    TurnRequest {
        session_id: session_id.to_string(),
        message: message.to_string(),
        conversation_history: Vec::new(),
    }
}

async fn seed_patience(backend: &MemorySessionBackend, session_id: &str, patience: f64) {
    let mut record = SessionRecord::new(session_id, Utc::now());
    record.patience_meter = patience;
    backend
        .merge_put(&record)
        .await
        .expect("failed to seed session");
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_payment_threat_extracts_handle_without_override() {
    let (engine, backend) = local_engine().await;
    seed_patience(&backend, "sess-upi", 80.0).await;

    let response = engine
        .handle_turn(request("sess-upi", "Pay 5000 to raju@upi or face arrest"))
        .await;

    assert_eq!(response.status, "success");
    assert!(response
        .extracted_intelligence
        .contains(IntelCategory::UpiIds, "raju@upi"));
    assert_eq!(response.decision.selection_path, SelectionPath::Hybrid);
    assert!(response.decision.tactic.is_learnable());
    assert!((response.patience_meter - 77.0).abs() < 1e-9);
    assert!(!response.reply.trim().is_empty());

    let reply = response.reply.to_lowercase();
    assert!(!(reply.contains("sent") && reply.contains("raju@upi")));
}

#[tokio::test]
async fn test_low_patience_forces_desperate_retention() {
    let (engine, backend) = local_engine().await;
    seed_patience(&backend, "sess-panic", 10.0).await;

    let response = engine
        .handle_turn(request("sess-panic", "are you there or not"))
        .await;

    assert_eq!(response.tactic, Tactic::DesperateRetention);
    assert_eq!(
        response.decision.selection_path,
        SelectionPath::PanicOverride
    );
    assert!(response.decision.payoff.is_none());

    let record = engine
        .session("sess-panic")
        .await
        .expect("lookup failed")
        .expect("session missing");
    assert_eq!(record.persona, "flustered");
}

#[tokio::test]
async fn test_sensitive_request_stalls() {
    let (engine, _backend) = local_engine().await;
    let response = engine
        .handle_turn(request("sess-otp", "share the OTP you just got"))
        .await;
    assert_eq!(response.tactic, Tactic::OtpStall);
    assert_eq!(
        response.decision.selection_path,
        SelectionPath::SensitiveRequestOverride
    );
}

#[tokio::test]
async fn test_total_collaborator_failure_still_replies() {
    let broken = Arc::new(Broken);
    let collaborators = Collaborators {
        extractor: broken.clone(),
        verifier: broken.clone(),
        generator: broken.clone(),
        renderer: broken.clone(),
        adjudicator: broken,
    };
    let (engine, _backend) =
        setup_engine(collaborators, settings(), Duration::from_secs(5)).await;

    let response = engine
        .handle_turn(request(
            "sess-broken",
            "Your account is blocked, send 2000 to fix@paytm now",
        ))
        .await;

    assert_eq!(response.status, "success");
    assert!(!response.reply.trim().is_empty());
    assert!(response.degraded);
    assert!(!response.decision.faults.is_empty());
    // Local fallbacks still found the handle.
    assert!(response
        .extracted_intelligence
        .contains(IntelCategory::UpiIds, "fix@paytm"));
}

#[tokio::test]
async fn test_stuck_collaborators_respect_turn_budget() {
    let stuck = Arc::new(Stuck);
    let collaborators = Collaborators {
        generator: stuck.clone(),
        renderer: stuck.clone(),
        adjudicator: stuck,
        ..Collaborators::local()
    };
    let (engine, _backend) =
        setup_engine(collaborators, settings(), Duration::from_secs(5)).await;

    let started = std::time::Instant::now();
    let response = engine
        .handle_turn(request("sess-stuck", "send the processing fee today"))
        .await;
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_secs(3), "turn took {elapsed:?}");
    assert!(!response.reply.trim().is_empty());
    assert!(response.degraded);
}

#[tokio::test]
async fn test_generator_reply_is_scrubbed() {
    let generator = Arc::new(Scripted {
        reply: "Done, I have sent 5000 to raju@upi, please check.",
        calls: AtomicUsize::new(0),
    });
    let collaborators = Collaborators {
        generator: generator.clone(),
        ..Collaborators::local()
    };
    let (engine, _backend) =
        setup_engine(collaborators, settings(), Duration::from_secs(5)).await;

    let response = engine
        .handle_turn(request("sess-scrub", "Pay 5000 to raju@upi or face arrest"))
        .await;

    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    assert!(!response.reply.contains("raju@upi"));
    assert!(!response.reply.trim().is_empty());
}

#[tokio::test]
async fn test_concurrent_turns_on_one_session_serialize() {
    let (engine, _backend) = local_engine().await;
    let engine = Arc::new(engine);
    const TURNS: usize = 8;

    let handles = (0..TURNS).map(|i| {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .handle_turn(request("sess-race", &format!("message number {i}, pay fast")))
                .await
        })
    });

    let mut turns: Vec<u32> = Vec::new();
    for joined in futures::future::join_all(handles).await {
        let response = joined.expect("turn task panicked");
        assert_ne!(
            response.decision.selection_path,
            SelectionPath::LockContention
        );
        turns.push(response.decision.turn);
    }
    turns.sort_unstable();
    assert_eq!(turns, (1..=TURNS as u32).collect::<Vec<_>>());

    let record = engine
        .session("sess-race")
        .await
        .expect("lookup failed")
        .expect("session missing");
    assert_eq!(record.turn_count, TURNS as u32);
    assert_eq!(record.history.len(), TURNS * 2);
}

#[tokio::test]
async fn test_lock_timeout_returns_degraded_reply() {
    let (engine, _backend) =
        setup_engine(Collaborators::local(), settings(), Duration::from_millis(50)).await;

    let held = engine
        .store()
        .acquire("sess-busy", Duration::from_secs(1))
        .await
        .expect("failed to take lock");

    let response = engine
        .handle_turn(request("sess-busy", "hello, are you there?"))
        .await;

    assert!(response.degraded);
    assert_eq!(
        response.decision.selection_path,
        SelectionPath::LockContention
    );
    assert_eq!(response.tactic, Tactic::SafeFallback);
    assert!(!response.reply.trim().is_empty());
    assert!(response
        .decision
        .faults
        .iter()
        .any(|fault| fault.starts_with("lock_timeout")));
    drop(held);

    // Nothing was written for the contended turn.
    assert!(engine.session("sess-busy").await.expect("lookup").is_none());
}

#[tokio::test]
async fn test_second_turn_rewards_previous_action() {
    let (engine, _backend) = local_engine().await;

    let first = engine
        .handle_turn(request("sess-learn", "Your KYC is pending, account will be blocked"))
        .await;
    assert_eq!(first.decision.reward, None);
    let first_key = first.decision.state_key.clone();
    let first_tactic = first.tactic;
    assert!(first_tactic.is_learnable());

    let second = engine
        .handle_turn(request(
            "sess-learn",
            "Send the fee to kyc.desk@okaxis, pay immediately",
        ))
        .await;

    // One new confirmed handle: 10 * 1 + 0.5, less 2 if this turn was
    // forced onto the defensive.
    let penalty = if second.tactic.is_defensive_override() {
        2.0
    } else {
        0.0
    };
    assert_eq!(second.decision.reward, Some(10.5 - penalty));
    let counts = engine
        .policy()
        .tables()
        .bandit_row(&first_key)
        .get(&first_tactic)
        .copied()
        .unwrap_or_default();
    assert_eq!(counts.successes, 1);
    assert_eq!(counts.failures, 0);
    assert!(engine.policy().tables().q_row(&first_key)[&first_tactic] > 0.0);
}

#[tokio::test]
async fn test_action_leading_into_panic_is_penalised() {
    let (engine, backend) = local_engine().await;
    // Each calm message costs 3 patience: 35 -> 32 stays above the panic
    // line, 32 -> 29 falls below it.
    seed_patience(&backend, "sess-slide", 35.0).await;

    let first = engine
        .handle_turn(request("sess-slide", "your parcel is held at customs office"))
        .await;
    assert_eq!(first.decision.selection_path, SelectionPath::Hybrid);
    assert!(first.tactic.is_learnable());
    let first_key = first.decision.state_key.clone();
    let first_tactic = first.tactic;

    let second = engine
        .handle_turn(request("sess-slide", "did you understand what I said"))
        .await;
    assert_eq!(second.tactic, Tactic::DesperateRetention);
    assert_eq!(second.decision.selection_path, SelectionPath::PanicOverride);

    // No new intel: 0.5 engagement less the defensive penalty.
    assert_eq!(second.decision.reward, Some(-1.5));
    let counts = engine
        .policy()
        .tables()
        .bandit_row(&first_key)
        .get(&first_tactic)
        .copied()
        .unwrap_or_default();
    assert_eq!((counts.successes, counts.failures), (0, 1));
    assert!(engine.policy().tables().q_row(&first_key)[&first_tactic] < 0.0);

    // The override itself never enters the tables.
    let record = engine
        .session("sess-slide")
        .await
        .expect("lookup failed")
        .expect("session missing");
    let previous = record.previous_turn.expect("previous turn missing");
    assert_eq!(previous.action, Tactic::DesperateRetention);
    assert!(engine
        .policy()
        .tables()
        .bandit_row(&second.decision.state_key)
        .get(&Tactic::DesperateRetention)
        .is_none());
}

#[tokio::test]
async fn test_history_seeds_only_new_sessions() {
    let (engine, _backend) = local_engine().await;

    let mut seeded = request("sess-seed", "did you do it?");
    seeded.conversation_history = vec![
        "Scammer: your parcel is held at customs".into(),
        "You: which parcel?".into(),
    ];
    let first = engine.handle_turn(seeded.clone()).await;
    assert!(!first.reply.is_empty());

    let record = engine
        .session("sess-seed")
        .await
        .expect("lookup failed")
        .expect("session missing");
    assert_eq!(record.history.len(), 4);
    assert_eq!(record.history[0], "Scammer: your parcel is held at customs");

    engine.handle_turn(seeded).await;
    let record = engine
        .session("sess-seed")
        .await
        .expect("lookup failed")
        .expect("session missing");
    assert_eq!(record.history.len(), 6);
}

#[tokio::test]
async fn test_flush_persists_to_backend() {
    let (engine, backend) = local_engine().await;
    engine
        .handle_turn(request("sess-flush", "send 500 rupees to verify your account"))
        .await;
    engine.shutdown().await;

    let stored = backend
        .get("sess-flush")
        .await
        .expect("backend read failed")
        .expect("session not persisted");
    assert_eq!(stored.turn_count, 1);
    assert!(stored.previous_turn.is_some());
}
