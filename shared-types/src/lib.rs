//! Shared types for the decoy dialogue engine
//!
//! These types are used by both:
//! - the engine (session store, policy, pipeline)
//! - HTTP consumers of the `/analyze` and `/sessions` endpoints
//!
//! Everything here is plain serde data; behavior lives in `decoy-engine`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Current on-disk layout of [`SessionRecord`].
pub const SESSION_SCHEMA_VERSION: u32 = 1;

/// Patience assigned to a session on its first turn.
pub const INITIAL_PATIENCE: f64 = 100.0;

// ============================================================================
// Tactics
// ============================================================================

/// Conversational strategy chosen for a turn.
///
/// The first six variants form the learnable catalogue; the rest are only
/// ever produced by override guards or fallbacks.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum Tactic {
    NormalChat,
    StallConfusion,
    StallFakeData,
    BaitForIntel,
    DeployFakeProof,
    SubmissiveApology,
    FastReflex,
    DesperateRetention,
    OtpStall,
    SafeFallback,
}

/// Action set the learning tables are defined over.
pub const POLICY_CATALOGUE: [Tactic; 6] = [
    Tactic::NormalChat,
    Tactic::StallConfusion,
    Tactic::StallFakeData,
    Tactic::BaitForIntel,
    Tactic::DeployFakeProof,
    Tactic::SubmissiveApology,
];

impl Tactic {
    pub fn is_learnable(self) -> bool {
        POLICY_CATALOGUE.contains(&self)
    }

    /// Tactics forced on the engine to defuse a hostile or collapsing
    /// conversation. The action that led into one is charged a small
    /// reward penalty.
    pub fn is_defensive_override(self) -> bool {
        matches!(self, Tactic::DesperateRetention | Tactic::SubmissiveApology)
    }
}

/// Row of the zero-sum payoff game.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter, AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum GameMove {
    Stall,
    Bait,
    Threaten,
    Comply,
}

// ============================================================================
// Intelligence
// ============================================================================

/// Category of identifying data pulled out of the counterpart's messages.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IntelCategory {
    UpiIds,
    BankAccounts,
    IfscCodes,
    PhoneNumbers,
    Urls,
}

/// Category → set of values. Sets keep entries deduplicated and ordered so
/// two records with the same content serialize identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtractedIntel(BTreeMap<IntelCategory, BTreeSet<String>>);

impl ExtractedIntel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value; empty or whitespace-only values are ignored.
    /// Returns true when the value was not present before.
    pub fn insert(&mut self, category: IntelCategory, value: impl Into<String>) -> bool {
        let value = value.into();
        let value = value.trim();
        if value.is_empty() {
            return false;
        }
        self.0
            .entry(category)
            .or_default()
            .insert(value.to_string())
    }

    /// Set union, per category.
    pub fn merge(&mut self, other: &ExtractedIntel) {
        for (category, values) in &other.0 {
            for value in values {
                self.insert(*category, value.clone());
            }
        }
    }

    pub fn values(&self, category: IntelCategory) -> impl Iterator<Item = &str> {
        self.0
            .get(&category)
            .into_iter()
            .flat_map(|values| values.iter().map(String::as_str))
    }

    pub fn contains(&self, category: IntelCategory, value: &str) -> bool {
        self.0
            .get(&category)
            .map(|values| values.contains(value))
            .unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (IntelCategory, &str)> {
        self.0
            .iter()
            .flat_map(|(category, values)| values.iter().map(move |v| (*category, v.as_str())))
    }

    /// Total number of values across all categories.
    pub fn total(&self) -> usize {
        self.0.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

impl FromIterator<(IntelCategory, String)> for ExtractedIntel {
    fn from_iter<I: IntoIterator<Item = (IntelCategory, String)>>(iter: I) -> Self {
        let mut intel = ExtractedIntel::new();
        for (category, value) in iter {
            intel.insert(category, value);
        }
        intel
    }
}

// ============================================================================
// Session Record
// ============================================================================

/// Snapshot taken when a tactic is chosen; the next turn uses it to assign
/// delayed reward to that choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviousTurn {
    pub turn: u32,
    pub scam_score: f64,
    pub action: Tactic,
    pub state_key: String,
    pub intel_count: usize,
}

/// Per-session conversation state.
///
/// Missing fields in a durable record fall back to their defaults; unknown
/// fields are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionRecord {
    pub schema_version: u32,
    pub session_id: String,
    /// Inbound and outbound turns, oldest first, bounded.
    pub history: Vec<String>,
    /// 0-100, running maximum of per-turn detection scores.
    pub scam_score: f64,
    pub scam_type: String,
    pub current_tactic: Option<Tactic>,
    pub persona: String,
    /// 0-100, only ever decreases.
    pub patience_meter: f64,
    pub extracted_data: ExtractedIntel,
    pub economic_damage: f64,
    pub previous_turn: Option<PreviousTurn>,
    pub predicted_move: Option<String>,
    pub emotion_history: Vec<String>,
    pub last_safety_note: Option<String>,
    pub turn_count: u32,
    pub session_started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_persist_at: Option<DateTime<Utc>>,
}

impl Default for SessionRecord {
    fn default() -> Self {
        Self {
            schema_version: SESSION_SCHEMA_VERSION,
            session_id: String::new(),
            history: Vec::new(),
            scam_score: 0.0,
            scam_type: "unknown".to_string(),
            current_tactic: None,
            persona: "default".to_string(),
            patience_meter: INITIAL_PATIENCE,
            extracted_data: ExtractedIntel::default(),
            economic_damage: 0.0,
            previous_turn: None,
            predicted_move: None,
            emotion_history: Vec::new(),
            last_safety_note: None,
            turn_count: 0,
            session_started_at: DateTime::<Utc>::default(),
            updated_at: DateTime::<Utc>::default(),
            last_persist_at: None,
        }
    }
}

impl SessionRecord {
    /// Empty record for an id that has never been seen.
    pub fn new(session_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.into(),
            session_started_at: now,
            updated_at: now,
            ..Self::default()
        }
    }

    pub fn confirmed_intel_count(&self) -> usize {
        self.extracted_data.total()
    }

    /// Keep only the newest `limit` history entries.
    pub fn truncate_history(&mut self, limit: usize) {
        if self.history.len() > limit {
            let excess = self.history.len() - limit;
            self.history.drain(..excess);
        }
    }
}

// ============================================================================
// Turn API
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub session_id: String,
    pub message: String,
    /// Prior turns known to the caller. Only used to seed a brand-new session.
    #[serde(default)]
    pub conversation_history: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResponse {
    pub status: String,
    pub session_id: String,
    pub reply: String,
    pub tactic: Tactic,
    /// True when the turn was answered without personalization (lock
    /// contention or total pipeline fallback).
    pub degraded: bool,
    pub typing_delay_ms: u64,
    pub scam_score: f64,
    pub scam_type: String,
    pub patience_meter: f64,
    pub extracted_intelligence: ExtractedIntel,
    pub decision: DecisionRecord,
}

// ============================================================================
// Decisions and Audit
// ============================================================================

/// Which branch of the strategize stage produced the tactic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SelectionPath {
    Reflex,
    PanicOverride,
    AggressionOverride,
    SensitiveRequestOverride,
    Hybrid,
    EpsilonGreedy,
    SafetyFallback,
    LockContention,
    PipelineFallback,
}

/// Advisory output of the payoff game for one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoffSignal {
    pub game_move: GameMove,
    /// Game value of the solved LP, or the maximin value on fallback.
    pub value: f64,
    /// Probability per row in [`GameMove`] order.
    pub mixed_strategy: Vec<f64>,
    pub converged: bool,
    /// Whether the policy's tactic falls on the sampled row.
    pub agrees_with_policy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SafetyVerdict {
    Approved,
    Rejected { reason: String },
    /// The adjudicator could not be reached; the draft was approved anyway.
    FailOpen { note: String },
}

impl SafetyVerdict {
    pub fn is_rejected(&self) -> bool {
        matches!(self, SafetyVerdict::Rejected { .. })
    }
}

/// Schema-valid summary of how a turn was decided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub decision_id: String,
    pub turn: u32,
    pub state_key: String,
    pub tactic: Tactic,
    pub selection_path: SelectionPath,
    pub confidence: f64,
    pub reasoning: String,
    pub payoff: Option<PayoffSignal>,
    pub safety: SafetyVerdict,
    pub predicted_move: Option<String>,
    /// Reward assigned this turn to the previous turn's action, if any.
    pub reward: Option<f64>,
    /// Error codes absorbed by stage fallbacks during this turn.
    pub faults: Vec<String>,
}

/// One entry handed to the append-only audit sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub session_id: String,
    pub turn: u32,
    pub actor: String,
    pub decision: String,
    pub reasoning: String,
    pub confidence: f64,
    pub input_fingerprint: String,
    pub output_fingerprint: String,
    pub recorded_at: DateTime<Utc>,
}
