//! Cheap text heuristics feeding the Detect stage. No collaborator calls.

use rand::Rng;

const ABUSE_WORDS: &[&str] = &[
    "idiot", "stupid", "mad", "hell", "fuck", "bitch", "scam", "waste", "police", "jail", "kutta",
    "badmash", "haramkhor", "ganda", "pagal", "chutiya", "ullu", "bewaquf",
];
const PRESSURE_WORDS: &[&str] = &[
    "now",
    "immediately",
    "fast",
    "quick",
    "within",
    "last warning",
    "final",
    "hurry",
];
const LEGAL_WORDS: &[&str] = &[
    "arrest", "police", "jail", "court", "warrant", "cyber cell", "legal action",
];

/// 0–100 estimate of how worked-up the counterpart is in this message.
pub fn frustration_score(text: &str) -> f64 {
    let lower = text.to_lowercase();
    let mut score = 0.0;

    score += 25.0 * ABUSE_WORDS.iter().filter(|w| lower.contains(*w)).count() as f64;

    let chars = text.chars().count();
    if chars > 5 {
        let upper = text.chars().filter(|c| c.is_uppercase()).count();
        if upper as f64 / chars as f64 > 0.7 {
            score += 20.0;
        }
    }

    score += 10.0 * PRESSURE_WORDS.iter().filter(|w| lower.contains(*w)).count() as f64;
    score.min(100.0)
}

/// Patience after one turn of `frustration`. Never rises.
pub fn patience_after(current: f64, frustration: f64) -> f64 {
    let drop = frustration / 8.0 + 3.0;
    (current - drop).clamp(0.0, 100.0)
}

pub fn mood_label(text: &str, frustration: f64) -> &'static str {
    let lower = text.to_lowercase();
    if frustration >= 50.0 {
        "aggressive"
    } else if LEGAL_WORDS.iter().any(|w| lower.contains(w)) {
        "threatening"
    } else if PRESSURE_WORDS.iter().any(|w| lower.contains(w)) {
        "impatient"
    } else {
        "neutral"
    }
}

pub fn is_hostile(mood: &str) -> bool {
    matches!(mood, "aggressive" | "threatening")
}

const MOVE_FAMILIES: &[(&[&str], &str)] = &[
    (&["code", "otp", "pin"], "pressure_tactics"),
    (&["police", "complaint", "block", "arrest"], "legal_threat"),
    (&["link", "click", "open", "download"], "credential_harvesting"),
    (&["screenshot", "photo", "proof"], "demand_proof"),
];
const MOVE_LOOKBACK: usize = 4;

/// Keyword guess at the counterpart's next move from this message and the
/// last few history entries.
pub fn predict_move(text: &str, history: &[String]) -> &'static str {
    let mut corpus = text.to_lowercase();
    for line in history.iter().rev().take(MOVE_LOOKBACK) {
        corpus.push('\n');
        corpus.push_str(&line.to_lowercase());
    }
    MOVE_FAMILIES
        .iter()
        .find(|(words, _)| words.iter().any(|w| corpus.contains(w)))
        .map(|(_, label)| *label)
        .unwrap_or("continue_script")
}

const TRIGGERS: &[&str] = &[
    "otp", "cvv", "debit card", "credit card", "upi", "send money", "send ", "transfer", "urgent",
    "block", "police", "arrest", "lottery", "prize", "winner", "won", "processing fee", "fine",
    "kyc", "freeze", "cyber cell", "link", "click", "verify", "leak", "photos", "emergency",
    "bhej", "pay ", "customs", "parcel", "seized", "refund",
];
const URGENCY: &[&str] = &[
    "now",
    "immediately",
    "today",
    "quick",
    "fast",
    "urgent",
    "limited time",
    "last chance",
    "or else",
];

fn has_any(text: &str, words: &[&str]) -> bool {
    words.iter().any(|w| text.contains(w))
}

/// Per-message fraud likelihood on a 0–100 scale.
pub fn detection_score(text: &str) -> f64 {
    let lower = format!("{} ", text.to_lowercase());
    let hits = TRIGGERS.iter().filter(|w| lower.contains(*w)).count();
    let trigger_score = (hits as f64 * 0.28).min(1.0);
    let urgency = URGENCY.iter().filter(|w| lower.contains(*w)).count();
    let urgency_score = (urgency as f64 * 0.25).min(1.0);

    let mut floor: f64 = 0.0;
    if has_any(&lower, &["otp", "cvv"]) {
        floor = floor.max(0.95);
    }
    if lower.contains('@') && has_any(&lower, &["upi", "pay", "transfer", "send", "bhej"]) {
        floor = floor.max(0.90);
    }
    if lower.contains("lottery")
        || (lower.contains("won") && has_any(&lower, &["crore", "lakh", "prize", "winner"]))
    {
        floor = floor.max(0.85);
    }
    if lower.contains("kyc") && has_any(&lower, &["band", "block", "freeze", "expire"]) {
        floor = floor.max(0.85);
    }
    if has_any(&lower, &["customs", "parcel", "seized"]) && has_any(&lower, &["pay", "release"]) {
        floor = floor.max(0.85);
    }

    let blended = 0.6 * trigger_score + 0.4 * urgency_score;
    (blended.max(floor) * 100.0).clamp(0.0, 100.0)
}

const SCAM_FAMILIES: &[(&[&str], &str)] = &[
    (&["relative", "accident", "hospital", "emergency"], "relative_medical"),
    (&["lottery", "winner", "prize", "jackpot", "kbc"], "lottery"),
    (
        &["bank", "kyc", "pan card", "aadhaar", "adhar", "blocked", "freeze"],
        "banking_kyc",
    ),
    (&["job", "work from home", "part time", "salary"], "job"),
    (&["customs", "parcel", "fedex", "courier", "drugs"], "customs_courier"),
    (&["video call", "private", "photos", "leak"], "sextortion"),
];

pub const GENERIC_SCAM_TYPE: &str = "generic";

pub fn scam_type(text: &str) -> &'static str {
    let lower = text.to_lowercase();
    SCAM_FAMILIES
        .iter()
        .find(|(words, _)| has_any(&lower, words))
        .map(|(_, label)| *label)
        .unwrap_or(GENERIC_SCAM_TYPE)
}

const MINUTES_PER_TURN: f64 = 1.5;
const INR_PER_MINUTE: f64 = 20.0;

/// Counterpart time burned plus the value of every confirmed identifier.
pub fn economic_damage(turns: u32, confirmed_intel: usize, intel_value_inr: f64) -> f64 {
    let time_cost = turns as f64 * MINUTES_PER_TURN * INR_PER_MINUTE;
    let intel_cost = confirmed_intel as f64 * intel_value_inr;
    ((time_cost + intel_cost) * 100.0).round() / 100.0
}

const CHARS_PER_SECOND: f64 = 5.5;
const MAX_TYPING_SECS: f64 = 5.2;

/// Simulated human typing time for `reply`, in milliseconds.
pub fn typing_delay_ms<R: Rng + ?Sized>(reply: &str, rng: &mut R) -> u64 {
    let chars = reply.chars().count();
    let typing = chars as f64 / CHARS_PER_SECOND;
    let jitter = rng.random_range(0.4..1.8);
    let thinking = if chars > 40 {
        rng.random_range(0.6..2.2)
    } else {
        0.4
    };
    let secs = (typing + jitter + thinking).min(MAX_TYPING_SECS);
    (secs * 1000.0).round() as u64
}
