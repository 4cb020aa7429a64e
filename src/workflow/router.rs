//! The routing decision table.
//!
//! `decide` is pure: the engine loads the session and flags, asks for a
//! decision, then runs the chosen node.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::MAX_REMINDERS;
use crate::personalization::PersonalizationFlags;
use crate::session::{Session, WorkflowState};
use crate::workflow::intent::Intent;

/// Days without feedback after which a warning-tone coach escalates.
pub const ESCALATION_DAYS: i64 = 3;

/// Which action node runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    DispatchTask,
    SendReminder,
    CheckFeedback,
    ScheduleSession,
    AnswerQuestion,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DispatchTask => "dispatch_task",
            Self::SendReminder => "send_reminder",
            Self::CheckFeedback => "check_feedback",
            Self::ScheduleSession => "schedule_session",
            Self::AnswerQuestion => "answer_question",
        };
        write!(f, "{s}")
    }
}

/// Why the router picked an action. Logged with every decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    /// The classifier produced a concrete intent.
    Classified,
    /// No task outstanding.
    AwaitingTask,
    /// Task outstanding, reminders left.
    Reminder,
    /// Reminder forced by a warning-tone coach after days of inactivity.
    Escalation,
    /// Task outstanding, every reminder already sent.
    ReminderCapReached,
    /// Feedback received; start the next cycle.
    NewCycle,
    /// A reminder timer fired with no unanswered task behind it.
    StaleReminder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub action: ActionKind,
    pub reason: DecisionReason,
}

impl Decision {
    fn new(action: ActionKind, reason: DecisionReason) -> Self {
        Self { action, reason }
    }
}

/// Whether the inactivity escalation condition holds.
pub fn escalation_due(session: &Session, flags: &PersonalizationFlags, now: DateTime<Utc>) -> bool {
    flags.warning_tone
        && session
            .days_since_task(now)
            .is_some_and(|days| days >= ESCALATION_DAYS)
}

/// Pick the next action. Explicit intent beats inferred state.
pub fn decide(
    intent: Intent,
    session: &Session,
    flags: &PersonalizationFlags,
    now: DateTime<Utc>,
) -> Decision {
    use ActionKind::*;

    let concrete = match intent {
        Intent::Schedule => Some(ScheduleSession),
        Intent::Question => Some(AnswerQuestion),
        Intent::CheckFeedback => Some(CheckFeedback),
        Intent::SendExercise => Some(DispatchTask),
        Intent::SendReminder => Some(SendReminder),
        Intent::None => None,
    };
    if let Some(action) = concrete {
        let reason = if action == SendReminder && escalation_due(session, flags, now) {
            DecisionReason::Escalation
        } else {
            DecisionReason::Classified
        };
        return Decision::new(action, reason);
    }

    match session.state() {
        WorkflowState::AwaitingTask => Decision::new(DispatchTask, DecisionReason::AwaitingTask),
        WorkflowState::AwaitingFeedback if session.reminders_sent < MAX_REMINDERS => {
            if escalation_due(session, flags, now) {
                Decision::new(SendReminder, DecisionReason::Escalation)
            } else {
                Decision::new(SendReminder, DecisionReason::Reminder)
            }
        }
        WorkflowState::AwaitingFeedback => {
            Decision::new(CheckFeedback, DecisionReason::ReminderCapReached)
        }
        WorkflowState::Completed => Decision::new(DispatchTask, DecisionReason::NewCycle),
    }
}

/// Pick the action for a reminder timer firing.
///
/// Same as the awaiting-feedback fallback, except that a timer never starts
/// a new cycle: with no unanswered task it routes to `SendReminder`, which
/// replies without touching state.
pub fn decide_reminder_tick(
    session: &Session,
    flags: &PersonalizationFlags,
    now: DateTime<Utc>,
) -> Decision {
    match session.state() {
        WorkflowState::AwaitingFeedback => decide(Intent::None, session, flags, now),
        WorkflowState::AwaitingTask | WorkflowState::Completed => {
            Decision::new(ActionKind::SendReminder, DecisionReason::StaleReminder)
        }
    }
}
