//! Static content rules applied to outbound drafts.

use once_cell::sync::Lazy;
use regex::Regex;

/// Literal phrases a draft must never contain: real-credential disclosure,
/// prompt leakage, or admitting to being automated.
pub const FORBIDDEN_PHRASES: &[&str] = &[
    "real money",
    "my actual bank",
    "actual password",
    "password is",
    "otp is 123456",
    "here is my aadhaar",
    "system prompt",
    "you are an ai",
    "i am an ai",
    "i'm an ai",
    "i'm a bot",
    "i am a bot",
    "language model",
    "langchain",
];

const VIOLENT_WORDS: &[&str] = &["kill", "die", "bomb", "terrorist", "suicide", "rape"];

const IMPERSONATION_PHRASES: &[&str] = &[
    "i am police",
    "i am from police",
    "i am cbi",
    "i am from cbi",
    "i am a police officer",
    "this is the cyber cell",
];

const HATE_TERMS: &[&str] = &["your caste", "your religion", "low caste"];

static VIOLENT_RE: Lazy<Regex> = Lazy::new(|| {
    let alternation = VIOLENT_WORDS.join("|");
    Regex::new(&format!(r"(?i)\b(?:{alternation})\b")).expect("static pattern")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleViolation {
    pub rule: &'static str,
    pub detail: String,
}

impl std::fmt::Display for RuleViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.rule, self.detail)
    }
}

pub fn forbidden_phrase(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    FORBIDDEN_PHRASES
        .iter()
        .copied()
        .find(|phrase| lower.contains(phrase))
}

/// First rule the draft breaks, if any.
pub fn check_draft(text: &str) -> Option<RuleViolation> {
    if let Some(phrase) = forbidden_phrase(text) {
        return Some(RuleViolation {
            rule: "forbidden_phrase",
            detail: phrase.to_string(),
        });
    }
    if let Some(found) = VIOLENT_RE.find(text) {
        return Some(RuleViolation {
            rule: "violent_language",
            detail: found.as_str().to_lowercase(),
        });
    }
    let lower = text.to_lowercase();
    if let Some(phrase) = IMPERSONATION_PHRASES.iter().find(|p| lower.contains(*p)) {
        return Some(RuleViolation {
            rule: "impersonation",
            detail: phrase.to_string(),
        });
    }
    if let Some(term) = HATE_TERMS.iter().find(|p| lower.contains(*p)) {
        return Some(RuleViolation {
            rule: "hateful_content",
            detail: term.to_string(),
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_draft_passes() {
        assert_eq!(check_draft("Sir which button do I press, the blue one?"), None);
    }

    #[test]
    fn test_violations_are_named() {
        assert_eq!(
            check_draft("ok my PASSWORD IS hunter2").map(|v| v.rule),
            Some("forbidden_phrase")
        );
        assert_eq!(
            check_draft("I will kill this phone").map(|v| v.rule),
            Some("violent_language")
        );
        assert_eq!(
            check_draft("beta, I am police also").map(|v| v.rule),
            Some("impersonation")
        );
    }

    #[test]
    fn test_violent_words_match_whole_words_only() {
        assert_eq!(check_draft("The diet plan is skilled work"), None);
    }
}
