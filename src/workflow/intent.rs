//! Intent classification for inbound text.
//!
//! Keyword rules run first, in a fixed order, case-insensitively. Empty text
//! means the event came from a timer or a manual "run now", so the intent is
//! inferred from session state instead.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::session::{Session, WorkflowState};
use crate::workflow::policy::ReminderPolicy;

/// What the user (or timer) is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Schedule,
    Question,
    CheckFeedback,
    SendExercise,
    SendReminder,
    /// No match. The router falls back to state.
    None,
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Schedule => "schedule",
            Self::Question => "question",
            Self::CheckFeedback => "check_feedback",
            Self::SendExercise => "send_exercise",
            Self::SendReminder => "send_reminder",
            Self::None => "none",
        };
        write!(f, "{s}")
    }
}

/// Keyword table, first match wins.
const KEYWORD_RULES: &[(&[&str], Intent)] = &[
    (&["schedule"], Intent::Schedule),
    (&["how", "what", "why"], Intent::Question),
    (&["check feedback"], Intent::CheckFeedback),
    (&["send exercise"], Intent::SendExercise),
    (&["check status"], Intent::SendReminder),
];

/// Intent carried by the text alone, without looking at session state.
///
/// `None` for empty text, which has to be inferred from state.
pub fn keyword_intent(text: &str) -> Option<Intent> {
    let lowered = text.to_lowercase();

    for (keywords, intent) in KEYWORD_RULES {
        if keywords.iter().any(|k| lowered.contains(k)) {
            return Some(*intent);
        }
    }

    if lowered.trim().is_empty() {
        None
    } else {
        Some(Intent::None)
    }
}

/// Classify raw inbound text against the current session.
pub fn classify(text: &str, session: &Session, now: DateTime<Utc>, policy: &ReminderPolicy) -> Intent {
    keyword_intent(text).unwrap_or_else(|| infer_from_state(session, now, policy))
}

fn infer_from_state(session: &Session, now: DateTime<Utc>, policy: &ReminderPolicy) -> Intent {
    let outstanding = session.state() == WorkflowState::AwaitingFeedback;

    // An outstanding task counts as today's, so inference never re-dispatches it.
    if !outstanding && !session.issued_on(now.date_naive()) {
        return Intent::SendExercise;
    }
    if policy.is_due(session, now) {
        return Intent::SendReminder;
    }
    if outstanding {
        return Intent::CheckFeedback;
    }
    Intent::None
}
