//! Coarse situation summary used to index the shared learning tables.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Early,
    Mid,
    Late,
}

impl TurnPhase {
    pub fn from_turn(turn: u32) -> Self {
        match turn {
            0..=2 => TurnPhase::Early,
            3..=7 => TurnPhase::Mid,
            _ => TurnPhase::Late,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            TurnPhase::Early => "EARLY",
            TurnPhase::Mid => "MID",
            TurnPhase::Late => "LATE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreatLevel {
    Low,
    High,
    Critical,
}

impl ThreatLevel {
    pub fn from_score(scam_score: f64) -> Self {
        if scam_score > 90.0 {
            ThreatLevel::Critical
        } else if scam_score > 70.0 {
            ThreatLevel::High
        } else {
            ThreatLevel::Low
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            ThreatLevel::Low => "LOW",
            ThreatLevel::High => "HIGH",
            ThreatLevel::Critical => "CRITICAL",
        }
    }
}

/// `PHASE_THREAT_CATEGORY`, e.g. `EARLY_HIGH_BANKING_KYC_PHISHING`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateKey(String);

impl StateKey {
    pub fn derive(turn: u32, scam_score: f64, scam_type: &str) -> Self {
        Self(format!(
            "{}_{}_{}",
            TurnPhase::from_turn(turn).as_str(),
            ThreatLevel::from_score(scam_score).as_str(),
            category_token(scam_type)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StateKey {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

fn category_token(scam_type: &str) -> String {
    let mut token = String::with_capacity(scam_type.len());
    for c in scam_type.trim().chars() {
        if c.is_ascii_alphanumeric() {
            token.push(c.to_ascii_uppercase());
        } else if !token.ends_with('_') && !token.is_empty() {
            token.push('_');
        }
    }
    let token = token.trim_end_matches('_');
    if token.is_empty() {
        "UNKNOWN".to_string()
    } else {
        token.to_string()
    }
}
