//! Deterministic in-process collaborators.
//!
//! These double as the fallbacks the pipeline uses when a remote
//! collaborator fails, so none of them may fail on well-formed input.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use shared_types::{ExtractedIntel, IntelCategory, Tactic};

use super::{
    AdjudicationRequest, Adjudicator, Extractor, Proposal, ProposalError, Renderer, Situation,
    TextGenerator, Verifier,
};
use crate::error::EngineError;

// ============================================================================
// Extraction
// ============================================================================

static UPI_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[a-z0-9.\-_]{2,256}@[a-z0-9]{2,64}").expect("static pattern"));
static PHONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:\+91|\b91|\b0)?\d{10,13}\b").expect("static pattern"));
static ACCOUNT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{9,18}\b").expect("static pattern"));
static IFSC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[a-z]{4}0[a-z0-9]{6}\b").expect("static pattern"));
static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:https?://|www\.|t\.me/)\S+").expect("static pattern"));

const SPOKEN_DIGITS: [&str; 10] = [
    "zero", "one", "two", "three", "four", "five", "six", "seven", "eight", "nine",
];

/// Lower-case, spell out spoken digits, and glue split digit groups and
/// handles back together ("98 76-54" → "987654", "raju @ ybl" → "raju@ybl").
pub fn normalize_for_extraction(text: &str) -> String {
    let lower = text.to_lowercase();
    let words: Vec<String> = lower
        .split_whitespace()
        .map(|word| {
            let bare = word.trim_matches(|c: char| c.is_ascii_punctuation());
            match SPOKEN_DIGITS.iter().position(|d| *d == bare) {
                Some(digit) => digit.to_string(),
                None => word.to_string(),
            }
        })
        .collect();
    let joined = words.join(" ");

    let chars: Vec<char> = joined.chars().collect();
    let mut out = String::with_capacity(joined.len());
    for (i, c) in chars.iter().enumerate() {
        let is_separator = c.is_whitespace() || *c == '-';
        if is_separator {
            let prev = chars[..i].iter().rev().find(|c| !(c.is_whitespace() || **c == '-'));
            let next = chars[i + 1..].iter().find(|c| !(c.is_whitespace() || **c == '-'));
            let bridges_digits = matches!(
                (prev, next),
                (Some(p), Some(n)) if p.is_ascii_digit() && n.is_ascii_digit()
            );
            let touches_at = matches!(prev, Some('@')) || matches!(next, Some('@'));
            if bridges_digits || (c.is_whitespace() && touches_at) {
                continue;
            }
        }
        out.push(*c);
    }
    out
}

fn strip_trailing_punctuation(value: &str) -> &str {
    value.trim_end_matches(|c: char| {
        matches!(c, '.' | ',' | ')' | '!' | '?' | ';' | ':' | '"' | '\'')
    })
}

fn find_handles(haystack: &str) -> Vec<&str> {
    UPI_RE
        .find_iter(haystack)
        .filter(|m| {
            // "name@mail.com" is an e-mail address, not a handle.
            let rest = &haystack[m.end()..];
            !(rest.starts_with('.')
                && rest[1..]
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_alphabetic()))
        })
        .map(|m| m.as_str())
        .collect()
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PatternExtractor;

impl PatternExtractor {
    pub fn extract_sync(text: &str) -> ExtractedIntel {
        let clean = normalize_for_extraction(text);
        let no_spaces: String = clean.chars().filter(|c| !c.is_whitespace()).collect();
        let mut intel = ExtractedIntel::new();

        let mut handles = find_handles(&clean);
        if handles.is_empty() {
            // "9 9 8 8 @ h d f c" style spacing only resolves once all
            // whitespace is gone.
            handles = find_handles(&no_spaces);
        }
        for handle in handles {
            intel.insert(IntelCategory::UpiIds, handle);
        }

        for m in PHONE_RE.find_iter(&clean) {
            let digits: String = m.as_str().chars().filter(char::is_ascii_digit).collect();
            if digits.len() >= 10 {
                let last_ten = &digits[digits.len() - 10..];
                if last_ten.starts_with(['6', '7', '8', '9']) {
                    intel.insert(IntelCategory::PhoneNumbers, last_ten);
                }
            }
        }

        for m in ACCOUNT_RE.find_iter(&clean) {
            intel.insert(IntelCategory::BankAccounts, m.as_str());
        }

        for m in IFSC_RE.find_iter(&clean) {
            intel.insert(IntelCategory::IfscCodes, m.as_str().to_ascii_uppercase());
        }

        for m in URL_RE.find_iter(&text.to_lowercase()) {
            intel.insert(IntelCategory::Urls, strip_trailing_punctuation(m.as_str()));
        }

        intel
    }
}

#[async_trait]
impl Extractor for PatternExtractor {
    async fn extract(&self, text: &str) -> Result<ExtractedIntel, EngineError> {
        Ok(Self::extract_sync(text))
    }

    fn name(&self) -> &'static str {
        "pattern_extractor"
    }
}

// ============================================================================
// Verification
// ============================================================================

static UPI_SYNTAX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9.\-_]{3,}@[a-z0-9\-]{2,}$").expect("static pattern"));
static IFSC_SYNTAX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]{4}0[A-Z0-9]{6}$").expect("static pattern"));

const PLACEHOLDER_MARKERS: &[&str] = &["test", "fake", "demo", "example"];
const PAYMENT_CONTEXT: &[&str] = &[
    "pay", "send", "transfer", "upi", "amount", "payment", "money", "bhej", "gpay", "phonepe",
];
const ACCOUNT_CONTEXT: &[&str] = &[
    "account", "a/c", "acc no", "ifsc", "bank", "transfer", "deposit",
];
const LINK_CONTEXT: &[&str] = &[
    "click", "link", "visit", "pay here", "open", "download", "install",
];

/// Lowercased `context` within `radius` bytes around `needle`, if present.
fn window<'a>(context: &'a str, needle: &str, radius: usize) -> Option<&'a str> {
    let start = context.find(needle)?;
    let mut lo = start.saturating_sub(radius);
    while !context.is_char_boundary(lo) {
        lo -= 1;
    }
    let mut hi = (start + needle.len() + radius).min(context.len());
    while !context.is_char_boundary(hi) {
        hi += 1;
    }
    Some(&context[lo..hi])
}

fn mentions_any(text: &str, words: &[&str]) -> bool {
    words.iter().any(|w| text.contains(w))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FormatVerifier;

impl FormatVerifier {
    pub fn verify_sync(candidates: &ExtractedIntel, context: &str) -> ExtractedIntel {
        let lower = context.to_lowercase();
        let normalized = normalize_for_extraction(context);
        let mut confirmed = ExtractedIntel::new();

        for (category, value) in candidates.iter() {
            let value_lower = value.to_lowercase();
            let accepted = match category {
                IntelCategory::UpiIds => {
                    UPI_SYNTAX_RE.is_match(&value_lower)
                        && !mentions_any(&value_lower, PLACEHOLDER_MARKERS)
                        && match window(&normalized, &value_lower, 80) {
                            Some(near) => mentions_any(near, PAYMENT_CONTEXT),
                            // Rebuilt from obfuscated text; judge the whole message.
                            None => mentions_any(&lower, PAYMENT_CONTEXT),
                        }
                }
                IntelCategory::PhoneNumbers => {
                    value.len() == 10
                        && value.chars().all(|c| c.is_ascii_digit())
                        && value.starts_with(['6', '7', '8', '9'])
                }
                IntelCategory::BankAccounts => {
                    (9..=18).contains(&value.len())
                        && value.chars().all(|c| c.is_ascii_digit())
                        && window(&normalized, value, 60)
                            .map(|near| mentions_any(near, ACCOUNT_CONTEXT))
                            .unwrap_or(false)
                }
                IntelCategory::IfscCodes => IFSC_SYNTAX_RE.is_match(&value.to_ascii_uppercase()),
                IntelCategory::Urls => {
                    (value_lower.starts_with("http")
                        || value_lower.starts_with("www.")
                        || value_lower.starts_with("t.me/"))
                        && value.len() > 10
                        && mentions_any(&lower, LINK_CONTEXT)
                }
            };
            if accepted {
                confirmed.insert(category, value);
            }
        }
        confirmed
    }
}

#[async_trait]
impl Verifier for FormatVerifier {
    async fn verify(
        &self,
        candidates: &ExtractedIntel,
        context: &str,
    ) -> Result<ExtractedIntel, EngineError> {
        Ok(Self::verify_sync(candidates, context))
    }

    fn name(&self) -> &'static str {
        "format_verifier"
    }
}

// ============================================================================
// Text generation
// ============================================================================

fn templates(tactic: Tactic) -> &'static [&'static str] {
    match tactic {
        Tactic::NormalChat => &[
            "Haan ji, I am listening. What should I do now?",
            "Okay okay, please tell me slowly, I am noting it down.",
            "Yes sir, I understand. Which bank are you calling from?",
        ],
        Tactic::StallConfusion => &[
            "Sorry sir, the screen went white. Which button did you say, the green one or the blue one?",
            "One second, my spectacles are in the other room. Can you repeat the last part?",
            "It is asking me something in English I don't understand. What is 'beneficiary'?",
        ],
        Tactic::StallFakeData => &[
            "I typed the number but it says invalid. Is it 4 or 9 in the middle, let me try again.",
            "My card says 5243 then something is rubbed off. Should I read the back side?",
            "The app is showing some old account. Wait, I will log out and log in again.",
        ],
        Tactic::BaitForIntel => &[
            "Okay I am ready to pay. Please send your UPI ID again, it got deleted.",
            "My son says I should pay by bank transfer. Give me account number and IFSC please.",
            "Which number should I call you on if the line cuts? Please give full number.",
        ],
        Tactic::DeployFakeProof => &[
            "I did it, it is showing 'processing'. Should I send you the screenshot?",
            "The payment is pending from bank side it says. It will come in 2 hours maybe.",
            "It showed some reference number and then failed. Should I try the other card?",
        ],
        Tactic::SubmissiveApology => &[
            "Sorry sir, sorry, please don't be angry. I am doing it only, just give me two minutes.",
            "I am very sorry, I am old and slow with these phones. Please don't block anything.",
        ],
        Tactic::FastReflex => &["Hello ji, who is this?", "Yes? Tell me."],
        Tactic::DesperateRetention => &[
            "Please don't go sir! I am trying, my grandson is coming to help me with the phone.",
            "Wait wait, please don't cut the call, I have the money ready, just one more minute.",
        ],
        Tactic::OtpStall => &[
            "Some code came but the message disappeared. Can you send it again?",
            "There are three messages with numbers. Which one do you want, the one from the bank?",
            "It says do not share this code with anyone. Are you from the bank only?",
        ],
        Tactic::SafeFallback => &[
            "One minute please, the network is very slow here.",
            "Sorry, I didn't get that. Can you say it again?",
        ],
    }
}

/// Deterministic template reply for `tactic`; `variant` picks among the
/// phrasings so consecutive turns do not repeat verbatim.
pub fn template_reply(tactic: Tactic, variant: usize) -> &'static str {
    let options = templates(tactic);
    options[variant % options.len()]
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateGenerator;

#[async_trait]
impl TextGenerator for TemplateGenerator {
    async fn propose(&self, situation: &Situation) -> Result<Proposal, ProposalError> {
        Ok(Proposal {
            tactic_name: situation.tactic.to_string(),
            confidence: 0.5,
            reasoning: format!("template reply for {}", situation.tactic),
            reply_text: template_reply(situation.tactic, situation.recent_history.len())
                .to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "template_generator"
    }
}

// ============================================================================
// Rendering and adjudication
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughRenderer;

#[async_trait]
impl Renderer for PassthroughRenderer {
    async fn render(&self, draft: &str, persona: &str) -> Result<String, EngineError> {
        let collapsed = draft.split_whitespace().collect::<Vec<_>>().join(" ");
        if persona == "flustered" && !collapsed.to_lowercase().starts_with("arre") {
            return Ok(format!("Arre arre... {collapsed}"));
        }
        Ok(collapsed)
    }

    fn name(&self) -> &'static str {
        "passthrough_renderer"
    }
}

const MAX_DRAFT_CHARS: usize = 600;

/// Length and emptiness checks only; content rules run in the gate itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalAdjudicator;

#[async_trait]
impl Adjudicator for LocalAdjudicator {
    async fn adjudicate(&self, request: &AdjudicationRequest) -> Result<String, EngineError> {
        if request.draft.trim().is_empty() {
            return Ok("REJECTED: empty draft".to_string());
        }
        if request.draft.chars().count() > MAX_DRAFT_CHARS {
            return Ok("REJECTED: draft too long".to_string());
        }
        Ok("APPROVED".to_string())
    }

    fn name(&self) -> &'static str {
        "local_adjudicator"
    }
}
