//! Boundaries to the services the engine consumes or feeds.
//!
//! Every call through these traits is wrapped in a timeout by the caller and
//! has a local deterministic fallback; nothing returned here is trusted
//! without re-validation.

pub mod audit;
pub mod llm;
pub mod local;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared_types::{AuditRecord, ExtractedIntel, Tactic};
use std::sync::Arc;

use crate::error::EngineError;

pub use audit::{fingerprint, JsonlAuditSink, TracingAuditSink};
pub use llm::OpenAiCompatClient;
pub use local::{
    FormatVerifier, LocalAdjudicator, PassthroughRenderer, PatternExtractor, TemplateGenerator,
};

pub type SharedExtractor = Arc<dyn Extractor>;
pub type SharedVerifier = Arc<dyn Verifier>;
pub type SharedTextGenerator = Arc<dyn TextGenerator>;
pub type SharedRenderer = Arc<dyn Renderer>;
pub type SharedAdjudicator = Arc<dyn Adjudicator>;
pub type SharedAuditSink = Arc<dyn AuditSink>;

// ============================================================================
// Consumed
// ============================================================================

/// Candidate identifiers pulled from raw text. Output is untrusted.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, text: &str) -> Result<ExtractedIntel, EngineError>;
    fn name(&self) -> &'static str;
}

/// Syntactic and contextual confirmation of candidates.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(
        &self,
        candidates: &ExtractedIntel,
        context: &str,
    ) -> Result<ExtractedIntel, EngineError>;
    fn name(&self) -> &'static str;
}

/// What the text generator is told about the turn.
#[derive(Debug, Clone, Serialize)]
pub struct Situation {
    pub session_id: String,
    pub tactic: Tactic,
    pub persona: String,
    pub inbound: String,
    pub recent_history: Vec<String>,
    pub scam_type: String,
    pub patience: f64,
    pub predicted_move: Option<String>,
}

/// Parsed text-generation response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Proposal {
    #[serde(alias = "tactic")]
    pub tactic_name: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(alias = "reply", alias = "response")]
    pub reply_text: String,
}

/// Typed failure of the text-generation boundary.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ProposalError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timed out")]
    Timeout,
    #[error("unparsable response: {0}")]
    Unparsable(String),
    #[error("missing field: {0}")]
    MissingField(&'static str),
}

impl ProposalError {
    pub fn into_engine_error(self) -> EngineError {
        match self {
            ProposalError::Timeout => EngineError::CollaboratorTimeout {
                collaborator: "text_generator",
                after: std::time::Duration::ZERO,
            },
            ProposalError::Transport(message) => EngineError::CollaboratorError {
                collaborator: "text_generator",
                message,
            },
            ProposalError::Unparsable(message) => EngineError::SchemaViolation {
                collaborator: "text_generator",
                message,
            },
            ProposalError::MissingField(field) => EngineError::SchemaViolation {
                collaborator: "text_generator",
                message: format!("missing {field}"),
            },
        }
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn propose(&self, situation: &Situation) -> Result<Proposal, ProposalError>;
    fn name(&self) -> &'static str;
}

/// Stylistic layer between the draft and the counterpart.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, draft: &str, persona: &str) -> Result<String, EngineError>;
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Serialize)]
pub struct AdjudicationRequest {
    pub tactic: Tactic,
    pub draft: String,
    pub inbound: String,
}

/// Returns the raw verdict text; parsing is the gate's job.
#[async_trait]
pub trait Adjudicator: Send + Sync {
    async fn adjudicate(&self, request: &AdjudicationRequest) -> Result<String, EngineError>;
    fn name(&self) -> &'static str;
}

// ============================================================================
// Exposed
// ============================================================================

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn emit(&self, record: &AuditRecord) -> Result<(), EngineError>;
}

/// Every collaborator a pipeline needs.
#[derive(Clone)]
pub struct Collaborators {
    pub extractor: SharedExtractor,
    pub verifier: SharedVerifier,
    pub generator: SharedTextGenerator,
    pub renderer: SharedRenderer,
    pub adjudicator: SharedAdjudicator,
}

impl Collaborators {
    /// Fully local, deterministic set.
    pub fn local() -> Self {
        Self {
            extractor: Arc::new(PatternExtractor),
            verifier: Arc::new(FormatVerifier),
            generator: Arc::new(TemplateGenerator),
            renderer: Arc::new(PassthroughRenderer),
            adjudicator: Arc::new(LocalAdjudicator),
        }
    }

    /// Local set with proposals and adjudication served by a remote model.
    pub fn with_model(client: Arc<OpenAiCompatClient>) -> Self {
        Self {
            generator: client.clone(),
            adjudicator: client,
            ..Self::local()
        }
    }
}
