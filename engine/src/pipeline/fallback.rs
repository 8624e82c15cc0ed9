//! Replies that exist without any collaborator.

use super::guards::PANIC_PERSONA;

const NEUTRAL: &[&str] = &[
    "One minute please, the network is very slow here.",
    "Sorry, I didn't get that. Can you say it again?",
    "Hold on, someone is at the door. I will come back in a minute.",
];

const FLUSTERED: &[&str] = &[
    "Arre arre, one second, my phone is hanging. Please wait.",
    "Arre, the screen went dark again. Don't go, I am here only.",
];

/// Non-empty reply consistent with `persona`.
pub fn fallback_reply(persona: &str, variant: usize) -> &'static str {
    let options = if persona == PANIC_PERSONA {
        FLUSTERED
    } else {
        NEUTRAL
    };
    options[variant % options.len()]
}

/// Non-personalised reply for turns that could not touch session state.
pub fn degraded_reply(variant: usize) -> &'static str {
    NEUTRAL[variant % NEUTRAL.len()]
}
