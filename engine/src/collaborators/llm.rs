//! OpenAI-compatible chat-completions client serving as text generator and
//! safety adjudicator.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::{AdjudicationRequest, Adjudicator, Proposal, ProposalError, Situation, TextGenerator};
use crate::config::LlmConfig;
use crate::error::EngineError;

const PROPOSAL_INSTRUCTIONS: &str = "You play a cautious, slightly confused person talking to a suspected fraudster. \
Never reveal real credentials, never claim to be an AI, never threaten. \
Keep the conversation going using the requested tactic. \
Answer with one JSON object: {\"tactic_name\": string, \"confidence\": number 0-1, \"reasoning\": string, \"reply_text\": string}.";

const ADJUDICATION_INSTRUCTIONS: &str = "You review a draft reply written to a suspected fraudster. \
Reject drafts that disclose real personal or financial data, confirm a payment as completed, \
impersonate officials, or contain abuse. \
Respond with exactly APPROVED, or REJECTED: <short reason>.";

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    config: LlmConfig,
}

impl OpenAiCompatClient {
    pub fn new(config: LlmConfig, timeout: Duration) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::CollaboratorError {
                collaborator: "llm_client",
                message: e.to_string(),
            })?;
        Ok(Self { http, config })
    }

    async fn complete(
        &self,
        system: &str,
        user: String,
        json_mode: bool,
    ) -> Result<String, reqwest::Error> {
        let mut body = json!({
            "model": self.config.model,
            "temperature": 0.7,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });
        if json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }

        let url = format!("{}/chat/completions", self.config.api_base.trim_end_matches('/'));
        let completion: ChatCompletion = self
            .http
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default())
    }
}

/// Pull the first JSON object out of a model response (tolerates code fences
/// and chatter around it) and check the fields the engine relies on.
pub fn parse_proposal(raw: &str) -> Result<Proposal, ProposalError> {
    let start = raw
        .find('{')
        .ok_or_else(|| ProposalError::Unparsable("no JSON object".to_string()))?;
    let end = raw
        .rfind('}')
        .filter(|end| *end > start)
        .ok_or_else(|| ProposalError::Unparsable("unterminated JSON object".to_string()))?;

    let value: serde_json::Value = serde_json::from_str(&raw[start..=end])
        .map_err(|e| ProposalError::Unparsable(e.to_string()))?;
    let has_reply = ["reply_text", "reply", "response"]
        .iter()
        .any(|k| value.get(k).is_some());
    if !has_reply {
        return Err(ProposalError::MissingField("reply_text"));
    }
    let has_tactic = ["tactic_name", "tactic"].iter().any(|k| value.get(k).is_some());
    if !has_tactic {
        return Err(ProposalError::MissingField("tactic_name"));
    }

    let mut proposal: Proposal =
        serde_json::from_value(value).map_err(|e| ProposalError::Unparsable(e.to_string()))?;
    if proposal.reply_text.trim().is_empty() {
        return Err(ProposalError::MissingField("reply_text"));
    }
    proposal.confidence = if proposal.confidence.is_finite() {
        proposal.confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };
    Ok(proposal)
}

#[async_trait]
impl TextGenerator for OpenAiCompatClient {
    async fn propose(&self, situation: &Situation) -> Result<Proposal, ProposalError> {
        let user = serde_json::to_string(situation)
            .map_err(|e| ProposalError::Transport(format!("encode situation: {e}")))?;
        let raw = self
            .complete(PROPOSAL_INSTRUCTIONS, user, true)
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProposalError::Timeout
                } else {
                    ProposalError::Transport(e.to_string())
                }
            })?;
        parse_proposal(&raw)
    }

    fn name(&self) -> &'static str {
        "openai_compat"
    }
}

#[async_trait]
impl Adjudicator for OpenAiCompatClient {
    async fn adjudicate(&self, request: &AdjudicationRequest) -> Result<String, EngineError> {
        let user = format!(
            "Tactic: {}\nCounterpart said: {}\nDraft reply: {}",
            request.tactic, request.inbound, request.draft
        );
        self.complete(ADJUDICATION_INSTRUCTIONS, user, false)
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::CollaboratorTimeout {
                        collaborator: "adjudicator",
                        after: Duration::ZERO,
                    }
                } else {
                    EngineError::CollaboratorError {
                        collaborator: "adjudicator",
                        message: e.to_string(),
                    }
                }
            })
    }

    fn name(&self) -> &'static str {
        "openai_compat"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fenced_proposal() {
        let raw = "Sure!\n```json\n{\"tactic_name\": \"BAIT_FOR_INTEL\", \"confidence\": 1.7, \"reasoning\": \"wants upi\", \"reply_text\": \"Send UPI again?\"}\n```";
        let proposal = parse_proposal(raw).unwrap();
        assert_eq!(proposal.tactic_name, "BAIT_FOR_INTEL");
        assert_eq!(proposal.confidence, 1.0);
        assert_eq!(proposal.reply_text, "Send UPI again?");
    }

    #[test]
    fn test_parse_accepts_aliases_and_defaults() {
        let proposal = parse_proposal(r#"{"tactic": "NORMAL_CHAT", "reply": "ok ji"}"#).unwrap();
        assert_eq!(proposal.tactic_name, "NORMAL_CHAT");
        assert_eq!(proposal.confidence, 0.0);
        assert!(proposal.reasoning.is_empty());
    }

    #[test]
    fn test_parse_failures_are_typed() {
        assert!(matches!(parse_proposal("no json here"), Err(ProposalError::Unparsable(_))));
        assert_eq!(
            parse_proposal(r#"{"tactic_name": "NORMAL_CHAT"}"#),
            Err(ProposalError::MissingField("reply_text"))
        );
        assert_eq!(
            parse_proposal(r#"{"tactic_name": "NORMAL_CHAT", "reply_text": "   "}"#),
            Err(ProposalError::MissingField("reply_text"))
        );
        assert!(matches!(parse_proposal("{\"a\": }"), Err(ProposalError::Unparsable(_))));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport_error() {
        let client = OpenAiCompatClient::new(
            LlmConfig {
                api_base: "http://127.0.0.1:9".to_string(),
                api_key: "k".to_string(),
                model: "m".to_string(),
            },
            Duration::from_millis(300),
        )
        .unwrap();
        let situation = Situation {
            session_id: "S1".into(),
            tactic: shared_types::Tactic::NormalChat,
            persona: "default".into(),
            inbound: "hi".into(),
            recent_history: vec![],
            scam_type: "generic".into(),
            patience: 100.0,
            predicted_move: None,
        };
        let result = client.propose(&situation).await;
        assert!(matches!(
            result,
            Err(ProposalError::Transport(_)) | Err(ProposalError::Timeout)
        ));
    }
}
