//! Personalization: coach-supplied instructions that shape outgoing messages.
//!
//! A coach attaches a free-text prompt to each user. The engine never shows
//! the prompt itself; it scans it for a few keywords and derives flags that
//! change the framing of dispatched tasks and reminders.

pub mod overlay;
pub mod source;

pub use overlay::PersonalizationOverlay;
pub use source::{HttpInstructionSource, InstructionSource, UnavailableSource};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prompt used when no coach instruction is available.
pub const DEFAULT_PROMPT: &str = "Motivate the user to stay consistent.";

/// A coach's personalization payload for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub prompt: String,
    pub coach_id: String,
    pub user_id: String,
    #[serde(default = "Utc::now", alias = "timestamp")]
    pub issued_at: DateTime<Utc>,
}

impl Instruction {
    /// The hardcoded fallback instruction.
    pub fn default_for(user_id: &str, coach_id: &str) -> Self {
        Self {
            prompt: DEFAULT_PROMPT.to_string(),
            coach_id: coach_id.to_string(),
            user_id: user_id.to_string(),
            issued_at: Utc::now(),
        }
    }

    pub fn flags(&self) -> PersonalizationFlags {
        derive_flags(&self.prompt)
    }
}

/// Tone of the motivational framing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotivationType {
    #[default]
    General,
    GoalReminder,
    Warning,
}

impl std::fmt::Display for MotivationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::General => "general",
            Self::GoalReminder => "goal_reminder",
            Self::Warning => "warning",
        };
        write!(f, "{s}")
    }
}

/// Display-affecting flags derived from an instruction prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonalizationFlags {
    pub include_goals: bool,
    pub warning_tone: bool,
    pub motivation_type: MotivationType,
}

/// Case-insensitive keyword scan of a coach prompt.
///
/// The warning check runs after the goal check, so a prompt with both
/// keywords ends up with `MotivationType::Warning`.
pub fn derive_flags(prompt: &str) -> PersonalizationFlags {
    let prompt = prompt.to_lowercase();
    let mut flags = PersonalizationFlags::default();

    if prompt.contains("goal") {
        flags.include_goals = true;
        flags.motivation_type = MotivationType::GoalReminder;
    }
    if prompt.contains("warn") || prompt.contains("lack of exercise") {
        flags.warning_tone = true;
        flags.motivation_type = MotivationType::Warning;
    }

    tracing::debug!(?flags, "Derived personalization flags");
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prompt_is_general() {
        let flags = derive_flags(DEFAULT_PROMPT);
        assert_eq!(flags, PersonalizationFlags::default());
        assert_eq!(flags.motivation_type, MotivationType::General);
    }

    #[test]
    fn goal_keyword() {
        let flags = derive_flags("Remind them of their GOALS every day");
        assert!(flags.include_goals);
        assert!(!flags.warning_tone);
        assert_eq!(flags.motivation_type, MotivationType::GoalReminder);
    }

    #[test]
    fn warning_keywords() {
        assert!(derive_flags("Warn the user gently").warning_tone);
        let flags = derive_flags("Point out the lack of exercise this week");
        assert!(flags.warning_tone);
        assert_eq!(flags.motivation_type, MotivationType::Warning);
    }

    #[test]
    fn warning_wins_motivation_type() {
        let flags = derive_flags("Mention goals, and warn about skipping");
        assert!(flags.include_goals);
        assert!(flags.warning_tone);
        assert_eq!(flags.motivation_type, MotivationType::Warning);
    }

    #[test]
    fn instruction_accepts_timestamp_alias() {
        let json = r#"{
            "prompt": "Keep it light",
            "coach_id": "c1",
            "user_id": "u1",
            "timestamp": "2025-01-01T08:00:00Z"
        }"#;
        let instruction: Instruction = serde_json::from_str(json).unwrap();
        assert_eq!(instruction.issued_at.to_rfc3339(), "2025-01-01T08:00:00+00:00");
    }

    #[test]
    fn motivation_type_display() {
        assert_eq!(MotivationType::GoalReminder.to_string(), "goal_reminder");
    }
}
