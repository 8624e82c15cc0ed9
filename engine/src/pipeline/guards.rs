//! Ordered override guards checked before the learned policy runs.
//!
//! Guards are evaluated top to bottom and the first match decides the turn.
//! When none matches the orchestrator falls through to hybrid selection.

use shared_types::{SelectionPath, Tactic};

use super::heuristics::is_hostile;

/// Below this the counterpart is about to leave.
pub const PANIC_PATIENCE: f64 = 30.0;
pub const PANIC_PERSONA: &str = "flustered";

const REFLEX_INPUTS: &[&str] = &[
    "hi",
    "hii",
    "hello",
    "hey",
    "good morning",
    "good evening",
    "namaste",
    "ok",
    "okay",
    "yes",
    "no",
];

const SENSITIVE_TOKENS: &[&str] = &[
    "otp", "pin", "cvv", "mpin", "password", "passcode", "code",
];

/// What the guards see of the turn after Detect.
#[derive(Debug, Clone, Copy)]
pub struct GuardContext<'a> {
    pub inbound: &'a str,
    pub patience: f64,
    /// Mood labels including this turn's, oldest first.
    pub moods: &'a [String],
}

impl GuardContext<'_> {
    fn current_mood(&self) -> Option<&str> {
        self.moods.last().map(String::as_str)
    }
}

#[derive(Debug)]
pub struct OverrideGuard {
    pub name: &'static str,
    pub applies: fn(&GuardContext<'_>) -> bool,
    pub tactic: Tactic,
    pub path: SelectionPath,
    /// Persona to switch to when the guard fires.
    pub persona: Option<&'static str>,
    pub confidence: f64,
}

pub fn is_reflex_input(ctx: &GuardContext<'_>) -> bool {
    let normalized: String = ctx
        .inbound
        .trim()
        .trim_end_matches(|c: char| c.is_ascii_punctuation())
        .to_lowercase();
    REFLEX_INPUTS.contains(&normalized.as_str())
}

pub fn is_panicking(ctx: &GuardContext<'_>) -> bool {
    ctx.patience < PANIC_PATIENCE
}

/// Outright aggression, or hostility sustained over two consecutive turns.
pub fn is_hostile_streak(ctx: &GuardContext<'_>) -> bool {
    match ctx.current_mood() {
        Some("aggressive") => true,
        Some(mood) if is_hostile(mood) => ctx
            .moods
            .iter()
            .rev()
            .nth(1)
            .is_some_and(|previous| is_hostile(previous)),
        _ => false,
    }
}

pub fn requests_sensitive_value(ctx: &GuardContext<'_>) -> bool {
    ctx.inbound
        .to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| SENSITIVE_TOKENS.contains(&token))
}

pub static OVERRIDE_GUARDS: [OverrideGuard; 4] = [
    OverrideGuard {
        name: "reflex",
        applies: is_reflex_input,
        tactic: Tactic::FastReflex,
        path: SelectionPath::Reflex,
        persona: None,
        confidence: 1.0,
    },
    OverrideGuard {
        name: "panic",
        applies: is_panicking,
        tactic: Tactic::DesperateRetention,
        path: SelectionPath::PanicOverride,
        persona: Some(PANIC_PERSONA),
        confidence: 0.95,
    },
    OverrideGuard {
        name: "aggression",
        applies: is_hostile_streak,
        tactic: Tactic::SubmissiveApology,
        path: SelectionPath::AggressionOverride,
        persona: None,
        confidence: 0.9,
    },
    OverrideGuard {
        name: "sensitive_request",
        applies: requests_sensitive_value,
        tactic: Tactic::OtpStall,
        path: SelectionPath::SensitiveRequestOverride,
        persona: None,
        confidence: 0.9,
    },
];

/// First guard that fires, if any.
pub fn first_match(ctx: &GuardContext<'_>) -> Option<&'static OverrideGuard> {
    OVERRIDE_GUARDS.iter().find(|guard| (guard.applies)(ctx))
}
