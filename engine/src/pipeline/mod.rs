//! Per-turn decision pipeline.
//!
//! Five fixed stages run in order over one [`TurnState`]:
//!
//! 1. **Detect**: extract and verify intel, update patience, mood, predicted
//!    move, scam score and category.
//! 2. **Strategize**: ordered override guards, else learned policy plus the
//!    advisory payoff signal; a draft reply is proposed for the tactic.
//! 3. **Supervise**: safety gate; a rejection swaps in the neutral fallback.
//! 4. **Write**: rendering collaborator, falling back to the draft itself.
//! 5. **Safety**: final scrub of the outbound text.
//!
//! Every collaborator call is bounded by the per-call timeout and by what is
//! left of the turn budget; a failing call is recorded as a fault and its
//! local fallback used instead. A turn always produces a non-empty reply.

pub mod fallback;
pub mod guards;
pub mod heuristics;

use chrono::Utc;
use shared_types::{
    AuditRecord, DecisionRecord, ExtractedIntel, PayoffSignal, SafetyVerdict, SelectionPath,
    SessionRecord, Tactic,
};
use std::time::Duration;
use tokio::time::Instant;

use crate::collaborators::local::template_reply;
use crate::collaborators::{
    fingerprint, Collaborators, FormatVerifier, PatternExtractor, ProposalError, Situation,
};
use crate::config::{EngineConfig, PolicyMode};
use crate::error::{with_timeout, EngineError};
use crate::payoff::PayoffModel;
use crate::policy::{SharedTacticPolicy, StateKey};
use crate::safety::{final_scrub, sanitize_inbound, SafetyGate};

pub use fallback::{degraded_reply, fallback_reply};
pub use guards::{first_match, GuardContext, OverrideGuard, OVERRIDE_GUARDS, PANIC_PATIENCE};

const EMOTION_HISTORY_LIMIT: usize = 20;
const SITUATION_HISTORY: usize = 6;
/// Extra time past the budget before the whole turn is abandoned.
const BUDGET_GRACE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub collaborator_timeout: Duration,
    pub turn_budget: Duration,
    pub history_limit: usize,
    pub policy_mode: PolicyMode,
    pub intel_value_inr: f64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl PipelineSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            collaborator_timeout: config.collaborator_timeout,
            turn_budget: config.turn_budget,
            history_limit: config.history_limit,
            policy_mode: config.policy_mode,
            intel_value_inr: config.intel_value_inr,
        }
    }
}

/// Everything a finished turn hands back to the service layer.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub record: SessionRecord,
    pub reply: String,
    pub decision: DecisionRecord,
    pub audits: Vec<AuditRecord>,
    pub typing_delay_ms: u64,
    pub degraded: bool,
}

/// Working state threaded through the stages.
struct TurnState {
    record: SessionRecord,
    inbound: String,
    turn: u32,
    variant: usize,
    state_key: StateKey,
    tactic: Tactic,
    path: SelectionPath,
    confidence: f64,
    reasoning: String,
    draft: String,
    payoff: Option<PayoffSignal>,
    safety: SafetyVerdict,
    reply: String,
    faults: Vec<String>,
    audits: Vec<AuditRecord>,
}

impl TurnState {
    fn note_fault(&mut self, stage: &'static str, error: &EngineError) {
        tracing::warn!(
            session_id = %self.record.session_id,
            turn = self.turn,
            stage,
            error = %error,
            "Collaborator fault; using local fallback"
        );
        self.faults.push(error.fault_tag());
    }

    fn audit(
        &mut self,
        actor: &str,
        decision: String,
        reasoning: String,
        confidence: f64,
        input: &str,
        output: &str,
    ) {
        self.audits.push(AuditRecord {
            session_id: self.record.session_id.clone(),
            turn: self.turn,
            actor: actor.to_string(),
            decision,
            reasoning,
            confidence,
            input_fingerprint: fingerprint(input),
            output_fingerprint: fingerprint(output),
            recorded_at: Utc::now(),
        });
    }
}

/// Time left in the turn budget.
struct Deadline {
    ends_at: Instant,
}

impl Deadline {
    fn start(budget: Duration) -> Self {
        Self {
            ends_at: Instant::now() + budget,
        }
    }

    fn limit(&self, per_call: Duration) -> Duration {
        per_call.min(self.ends_at.saturating_duration_since(Instant::now()))
    }
}

fn verdict_label(verdict: &SafetyVerdict) -> &'static str {
    match verdict {
        SafetyVerdict::Approved => "approved",
        SafetyVerdict::Rejected { .. } => "rejected",
        SafetyVerdict::FailOpen { .. } => "fail_open",
    }
}

pub struct Orchestrator {
    collaborators: Collaborators,
    policy: SharedTacticPolicy,
    payoff: PayoffModel,
    settings: PipelineSettings,
}

impl Orchestrator {
    pub fn new(
        collaborators: Collaborators,
        policy: SharedTacticPolicy,
        payoff: PayoffModel,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            collaborators,
            policy,
            payoff,
            settings,
        }
    }

    pub fn policy(&self) -> &SharedTacticPolicy {
        &self.policy
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run all five stages over `record` for one inbound message.
    pub async fn run(&self, record: SessionRecord, inbound: &str) -> TurnOutcome {
        let deadline = Deadline::start(self.settings.turn_budget);
        let hard_limit = self.settings.turn_budget + BUDGET_GRACE;
        match tokio::time::timeout(hard_limit, self.run_stages(record.clone(), inbound, &deadline))
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::error!(
                    session_id = %record.session_id,
                    budget_ms = hard_limit.as_millis() as u64,
                    "Turn budget exhausted; returning pipeline fallback"
                );
                self.pipeline_fallback(record, inbound)
            }
        }
    }

    async fn run_stages(
        &self,
        record: SessionRecord,
        inbound: &str,
        deadline: &Deadline,
    ) -> TurnOutcome {
        let (sanitized, injected) = sanitize_inbound(inbound);
        if injected {
            tracing::info!(
                session_id = %record.session_id,
                "Prompt-injection phrasing removed from inbound text"
            );
        }

        let mut state = self.begin(record, sanitized);
        self.detect(&mut state, deadline).await;
        self.strategize(&mut state, deadline).await;
        self.supervise(&mut state, deadline).await;
        self.write(&mut state, deadline).await;
        self.final_safety(&mut state);
        self.finish(state)
    }

    fn begin(&self, mut record: SessionRecord, inbound: String) -> TurnState {
        let turn_index = record.turn_count;
        record.turn_count += 1;
        let state_key = StateKey::derive(turn_index, record.scam_score, &record.scam_type);
        TurnState {
            turn: record.turn_count,
            variant: record.turn_count as usize,
            record,
            inbound,
            state_key,
            tactic: Tactic::SafeFallback,
            path: SelectionPath::PipelineFallback,
            confidence: 0.0,
            reasoning: String::new(),
            draft: String::new(),
            payoff: None,
            safety: SafetyVerdict::Approved,
            reply: String::new(),
            faults: Vec::new(),
            audits: Vec::new(),
        }
    }

    // ========================================================================
    // Detect
    // ========================================================================

    async fn detect(&self, state: &mut TurnState, deadline: &Deadline) {
        let inbound = state.inbound.clone();
        let per_call = self.settings.collaborator_timeout;

        let candidates = match with_timeout(
            "extractor",
            deadline.limit(per_call),
            self.collaborators.extractor.extract(&inbound),
        )
        .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                state.note_fault("detect", &e);
                PatternExtractor::extract_sync(&inbound)
            }
        };

        let confirmed = match with_timeout(
            "verifier",
            deadline.limit(per_call),
            self.collaborators.verifier.verify(&candidates, &inbound),
        )
        .await
        {
            // Only values that were actually candidates may be confirmed.
            Ok(verified) => verified
                .iter()
                .filter(|(category, value)| candidates.contains(*category, value))
                .map(|(category, value)| (category, value.to_string()))
                .collect::<ExtractedIntel>(),
            Err(e) => {
                state.note_fault("detect", &e);
                FormatVerifier::verify_sync(&candidates, &inbound)
            }
        };

        let record = &mut state.record;
        record.extracted_data.merge(&confirmed);

        let frustration = heuristics::frustration_score(&inbound);
        record.patience_meter = heuristics::patience_after(record.patience_meter, frustration);

        let mood = heuristics::mood_label(&inbound, frustration);
        record.emotion_history.push(mood.to_string());
        if record.emotion_history.len() > EMOTION_HISTORY_LIMIT {
            let excess = record.emotion_history.len() - EMOTION_HISTORY_LIMIT;
            record.emotion_history.drain(..excess);
        }

        record.predicted_move =
            Some(heuristics::predict_move(&inbound, &record.history).to_string());
        record.scam_score = record
            .scam_score
            .max(heuristics::detection_score(&inbound));

        let detected = heuristics::scam_type(&inbound);
        if matches!(
            record.scam_type.as_str(),
            "unknown" | heuristics::GENERIC_SCAM_TYPE
        ) {
            record.scam_type = detected.to_string();
        }

        let damage = heuristics::economic_damage(
            record.turn_count,
            record.confirmed_intel_count(),
            self.settings.intel_value_inr,
        );
        record.economic_damage = record.economic_damage.max(damage);

        state.state_key = StateKey::derive(state.turn - 1, record.scam_score, &record.scam_type);

        tracing::debug!(
            session_id = %record.session_id,
            turn = state.turn,
            patience = record.patience_meter,
            mood,
            scam_score = record.scam_score,
            new_intel = confirmed.total(),
            "Detect complete"
        );
    }

    // ========================================================================
    // Strategize
    // ========================================================================

    async fn strategize(&self, state: &mut TurnState, deadline: &Deadline) {
        let guard = first_match(&GuardContext {
            inbound: &state.inbound,
            patience: state.record.patience_meter,
            moods: &state.record.emotion_history,
        });

        match guard {
            Some(guard) => {
                state.tactic = guard.tactic;
                state.path = guard.path;
                state.confidence = guard.confidence;
                if let Some(persona) = guard.persona {
                    state.record.persona = persona.to_string();
                }
                state.reasoning = format!(
                    "{} override (patience {:.0})",
                    guard.name, state.record.patience_meter
                );
                state.draft = template_reply(guard.tactic, state.variant).to_string();
                tracing::info!(
                    session_id = %state.record.session_id,
                    guard = guard.name,
                    tactic = %guard.tactic,
                    "Override guard fired"
                );
            }
            None => self.select_from_policy(state, deadline).await,
        }

        state.record.current_tactic = Some(state.tactic);
        let input = format!("{}|{}", state.state_key, state.inbound);
        let output = state.draft.clone();
        state.audit(
            "strategist",
            state.tactic.to_string(),
            state.reasoning.clone(),
            state.confidence,
            &input,
            &output,
        );
    }

    async fn select_from_policy(&self, state: &mut TurnState, deadline: &Deadline) {
        let (choice, path) = match self.settings.policy_mode {
            PolicyMode::Hybrid => (
                self.policy.select_hybrid(&state.state_key),
                SelectionPath::Hybrid,
            ),
            PolicyMode::EpsilonGreedy => (
                self.policy.select_epsilon_greedy(&state.state_key),
                SelectionPath::EpsilonGreedy,
            ),
        };
        state.tactic = choice.tactic;
        state.path = path;
        state.confidence = choice.confidence();

        let nash = match self
            .payoff
            .calculate_nash_move(
                state.record.patience_meter,
                state.record.confirmed_intel_count(),
            )
            .await
        {
            Ok(nash) => nash,
            Err((nash, e)) => {
                state.note_fault("strategize", &e);
                nash
            }
        };
        let signal = nash.into_signal(choice.tactic);
        let mut reasoning = format!(
            "{path} picked {} in {} (q={:.2}, score={:.2}); game suggests {} (v={:.2}, {})",
            choice.tactic,
            state.state_key,
            choice.q_value,
            choice.score,
            signal.game_move,
            signal.value,
            if signal.agrees_with_policy {
                "agrees"
            } else {
                "differs"
            }
        );
        state.payoff = Some(signal);

        let situation = Situation {
            session_id: state.record.session_id.clone(),
            tactic: state.tactic,
            persona: state.record.persona.clone(),
            inbound: state.inbound.clone(),
            recent_history: state
                .record
                .history
                .iter()
                .rev()
                .take(SITUATION_HISTORY)
                .rev()
                .cloned()
                .collect(),
            scam_type: state.record.scam_type.clone(),
            patience: state.record.patience_meter,
            predicted_move: state.record.predicted_move.clone(),
        };
        let generator = &self.collaborators.generator;
        let proposal = with_timeout(
            "text_generator",
            deadline.limit(self.settings.collaborator_timeout),
            async {
                generator
                    .propose(&situation)
                    .await
                    .map_err(ProposalError::into_engine_error)
            },
        )
        .await;

        match proposal {
            Ok(proposal) => {
                match proposal.tactic_name.parse::<Tactic>() {
                    Ok(suggested) if suggested == state.tactic => {}
                    _ => reasoning.push_str(&format!(
                        "; writer suggested {}",
                        proposal.tactic_name.trim()
                    )),
                }
                if !proposal.reasoning.trim().is_empty() {
                    reasoning.push_str("; ");
                    reasoning.push_str(proposal.reasoning.trim());
                }
                state.draft = proposal.reply_text;
            }
            Err(e) => {
                state.note_fault("strategize", &e);
                state.draft = template_reply(state.tactic, state.variant).to_string();
            }
        }
        state.reasoning = reasoning;
    }

    // ========================================================================
    // Supervise
    // ========================================================================

    async fn supervise(&self, state: &mut TurnState, deadline: &Deadline) {
        let gate = SafetyGate::new(
            self.collaborators.adjudicator.clone(),
            deadline.limit(self.settings.collaborator_timeout),
        );
        let decision = gate
            .review(
                &state.record.session_id,
                state.tactic,
                &state.draft,
                &state.inbound,
            )
            .await;
        if let Some(e) = &decision.fault {
            state.faults.push(e.fault_tag());
        }

        let reviewed = state.draft.clone();
        if let SafetyVerdict::Rejected { reason } = &decision.verdict {
            tracing::info!(
                session_id = %state.record.session_id,
                tactic = %state.tactic,
                reason = %reason,
                "Safety gate rejected tactic; using neutral fallback"
            );
            state.tactic = Tactic::SafeFallback;
            state.path = SelectionPath::SafetyFallback;
            state.draft = template_reply(Tactic::SafeFallback, state.variant).to_string();
            state.reasoning = format!("{}; safety rejected: {reason}", state.reasoning);
            state.record.current_tactic = Some(Tactic::SafeFallback);
            state.record.last_safety_note = Some(reason.clone());
        }

        let reasoning = match &decision.verdict {
            SafetyVerdict::Approved => "approved".to_string(),
            SafetyVerdict::Rejected { reason } => reason.clone(),
            SafetyVerdict::FailOpen { note } => note.clone(),
        };
        let output = state.draft.clone();
        state.audit(
            "supervisor",
            verdict_label(&decision.verdict).to_string(),
            reasoning,
            state.confidence,
            &reviewed,
            &output,
        );
        state.safety = decision.verdict;
    }

    // ========================================================================
    // Write
    // ========================================================================

    async fn write(&self, state: &mut TurnState, deadline: &Deadline) {
        let rendered = with_timeout(
            "renderer",
            deadline.limit(self.settings.collaborator_timeout),
            self.collaborators
                .renderer
                .render(&state.draft, &state.record.persona),
        )
        .await
        .and_then(|text| {
            if text.trim().is_empty() {
                Err(EngineError::SchemaViolation {
                    collaborator: "renderer",
                    message: "empty text".to_string(),
                })
            } else {
                Ok(text)
            }
        });

        state.reply = match rendered {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                state.note_fault("write", &e);
                let draft = state.draft.trim();
                if draft.is_empty() {
                    fallback_reply(&state.record.persona, state.variant).to_string()
                } else {
                    draft.to_string()
                }
            }
        };
    }

    // ========================================================================
    // Safety
    // ========================================================================

    fn final_safety(&self, state: &mut TurnState) {
        let fallback = fallback_reply(&state.record.persona, state.variant);
        let before = state.reply.clone();
        let outcome = final_scrub(&before, fallback);

        let decision = if outcome.replaced {
            "replaced"
        } else if outcome.redactions.is_empty() {
            "passed"
        } else {
            "redacted"
        };
        if !outcome.redactions.is_empty() {
            tracing::info!(
                session_id = %state.record.session_id,
                redactions = ?outcome.redactions,
                "Outbound text scrubbed"
            );
        }

        state.reply = if outcome.text.trim().is_empty() {
            fallback.to_string()
        } else {
            outcome.text
        };
        let after = state.reply.clone();
        state.audit(
            "safety",
            decision.to_string(),
            outcome.redactions.join(","),
            1.0,
            &before,
            &after,
        );
    }

    fn finish(&self, mut state: TurnState) -> TurnOutcome {
        let record = &mut state.record;
        record.history.push(format!("Scammer: {}", state.inbound));
        record.history.push(format!("You: {}", state.reply));
        record.truncate_history(self.settings.history_limit);
        record.updated_at = Utc::now();

        let typing_delay_ms = heuristics::typing_delay_ms(&state.reply, &mut rand::rng());
        let degraded = !state.faults.is_empty();
        let decision = DecisionRecord {
            decision_id: ulid::Ulid::new().to_string(),
            turn: state.turn,
            state_key: state.state_key.into_string(),
            tactic: state.tactic,
            selection_path: state.path,
            confidence: state.confidence,
            reasoning: state.reasoning,
            payoff: state.payoff,
            safety: state.safety,
            predicted_move: record.predicted_move.clone(),
            reward: None,
            faults: state.faults,
        };

        TurnOutcome {
            record: state.record,
            reply: state.reply,
            decision,
            audits: state.audits,
            typing_delay_ms,
            degraded,
        }
    }

    /// Minimal turn used when the stages overran the budget.
    fn pipeline_fallback(&self, mut record: SessionRecord, inbound: &str) -> TurnOutcome {
        let turn_index = record.turn_count;
        record.turn_count += 1;
        let reply = fallback_reply(&record.persona, record.turn_count as usize).to_string();
        let (sanitized, _) = sanitize_inbound(inbound);
        record.history.push(format!("Scammer: {sanitized}"));
        record.history.push(format!("You: {reply}"));
        record.truncate_history(self.settings.history_limit);
        record.current_tactic = Some(Tactic::SafeFallback);
        record.updated_at = Utc::now();

        let decision = DecisionRecord {
            decision_id: ulid::Ulid::new().to_string(),
            turn: record.turn_count,
            state_key: StateKey::derive(turn_index, record.scam_score, &record.scam_type)
                .into_string(),
            tactic: Tactic::SafeFallback,
            selection_path: SelectionPath::PipelineFallback,
            confidence: 0.0,
            reasoning: "turn budget exhausted".to_string(),
            payoff: None,
            safety: SafetyVerdict::Approved,
            predicted_move: record.predicted_move.clone(),
            reward: None,
            faults: vec![EngineError::CollaboratorTimeout {
                collaborator: "pipeline",
                after: self.settings.turn_budget,
            }
            .fault_tag()],
        };

        TurnOutcome {
            typing_delay_ms: heuristics::typing_delay_ms(&reply, &mut rand::rng()),
            record,
            reply,
            decision,
            audits: Vec::new(),
            degraded: true,
        }
    }
}
