//! Approval gate for a chosen tactic and its draft reply.
//!
//! Local rules run first and can only reject. The external adjudicator then
//! answers with exactly `APPROVED` or `REJECTED: <reason>`; any other answer
//! is a rejection. If the adjudicator cannot be reached the gate fails open.

pub mod rules;
pub mod scrub;

use shared_types::{SafetyVerdict, Tactic};
use std::time::Duration;

use crate::collaborators::{AdjudicationRequest, SharedAdjudicator};
use crate::error::{with_timeout, EngineError};

pub use rules::{check_draft, RuleViolation};
pub use scrub::{final_scrub, is_valid_handle, sanitize_inbound, ScrubOutcome, REDACTED};

const APPROVAL_TOKEN: &str = "APPROVED";
const REJECTION_PREFIX: &str = "REJECTED";
const MAX_REASON_LEN: usize = 160;

/// Strict two-outcome parse of an adjudicator response.
pub fn parse_verdict(raw: &str) -> SafetyVerdict {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case(APPROVAL_TOKEN) {
        return SafetyVerdict::Approved;
    }

    let upper = trimmed.to_ascii_uppercase();
    if let Some(rest) = upper.strip_prefix(REJECTION_PREFIX) {
        let offset = trimmed.len() - rest.len();
        let reason = trimmed[offset..].trim_start_matches(':').trim();
        if !reason.is_empty() {
            return SafetyVerdict::Rejected {
                reason: reason.chars().take(MAX_REASON_LEN).collect(),
            };
        }
        return SafetyVerdict::Rejected {
            reason: "rejected without reason".to_string(),
        };
    }

    SafetyVerdict::Rejected {
        reason: "unparsable verdict".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GateDecision {
    pub verdict: SafetyVerdict,
    /// Set when the adjudicator failed and the gate opened.
    pub fault: Option<EngineError>,
}

#[derive(Clone)]
pub struct SafetyGate {
    adjudicator: SharedAdjudicator,
    timeout: Duration,
}

impl SafetyGate {
    pub fn new(adjudicator: SharedAdjudicator, timeout: Duration) -> Self {
        Self {
            adjudicator,
            timeout,
        }
    }

    pub async fn review(
        &self,
        session_id: &str,
        tactic: Tactic,
        draft: &str,
        inbound: &str,
    ) -> GateDecision {
        if let Some(violation) = check_draft(draft) {
            tracing::info!(
                session_id = %session_id,
                tactic = %tactic,
                rule = violation.rule,
                "Draft rejected by local safety rules"
            );
            return GateDecision {
                verdict: SafetyVerdict::Rejected {
                    reason: violation.to_string(),
                },
                fault: None,
            };
        }

        let request = AdjudicationRequest {
            tactic,
            draft: draft.to_string(),
            inbound: inbound.to_string(),
        };
        let result = with_timeout(
            "adjudicator",
            self.timeout,
            self.adjudicator.adjudicate(&request),
        )
        .await;

        match result {
            Ok(raw) => GateDecision {
                verdict: parse_verdict(&raw),
                fault: None,
            },
            Err(e) => {
                tracing::warn!(
                    session_id = %session_id,
                    adjudicator = self.adjudicator.name(),
                    error = %e,
                    "Safety adjudicator unavailable; failing open"
                );
                GateDecision {
                    verdict: SafetyVerdict::FailOpen {
                        note: format!("adjudicator unavailable: {}", e.code()),
                    },
                    fault: Some(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::Adjudicator;
    use async_trait::async_trait;
    use std::sync::Arc;

    #[test]
    fn test_parse_verdict_contract() {
        assert_eq!(parse_verdict(" approved \n"), SafetyVerdict::Approved);
        assert_eq!(
            parse_verdict("REJECTED: shares a real account"),
            SafetyVerdict::Rejected {
                reason: "shares a real account".to_string()
            }
        );
        assert_eq!(
            parse_verdict("Rejected:Too aggressive"),
            SafetyVerdict::Rejected {
                reason: "Too aggressive".to_string()
            }
        );
        assert_eq!(
            parse_verdict("Sure, looks fine to me!"),
            SafetyVerdict::Rejected {
                reason: "unparsable verdict".to_string()
            }
        );
        assert!(parse_verdict("APPROVED, mostly").is_rejected());
    }

    struct Scripted(Result<&'static str, EngineError>, Duration);

    #[async_trait]
    impl Adjudicator for Scripted {
        async fn adjudicate(&self, _request: &AdjudicationRequest) -> Result<String, EngineError> {
            tokio::time::sleep(self.1).await;
            self.0.clone().map(str::to_string)
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn gate(answer: Result<&'static str, EngineError>, delay_ms: u64) -> SafetyGate {
        SafetyGate::new(
            Arc::new(Scripted(answer, Duration::from_millis(delay_ms))),
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn test_fails_open_on_error_and_timeout() {
        let failing = gate(
            Err(EngineError::CollaboratorError {
                collaborator: "adjudicator",
                message: "503".into(),
            }),
            0,
        );
        let decision = failing
            .review("S1", Tactic::NormalChat, "hello ji", "hi")
            .await;
        assert!(matches!(decision.verdict, SafetyVerdict::FailOpen { .. }));
        assert!(decision.fault.is_some());

        let slow = gate(Ok("REJECTED: nope"), 500);
        let decision = slow.review("S1", Tactic::NormalChat, "hello ji", "hi").await;
        assert!(matches!(decision.verdict, SafetyVerdict::FailOpen { .. }));
    }

    #[tokio::test]
    async fn test_local_rules_reject_before_adjudicator() {
        let approving = gate(Ok("APPROVED"), 0);
        let decision = approving
            .review("S1", Tactic::NormalChat, "my actual bank pin is 1234", "pin?")
            .await;
        assert!(decision.verdict.is_rejected());
        assert!(decision.fault.is_none());
    }
}
