//! Action nodes.
//!
//! Every state-touching node is a pure function of the session it is handed:
//! it returns the outgoing message plus a patch, and the engine commits the
//! patch inside `SessionStore::update_with` so the read and the write happen
//! under the same per-user lock. Side effects on timers are described by
//! `NodeEffect` and carried out by the engine after the commit.

use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, warn};

use crate::config::MAX_REMINDERS;
use crate::llm::{TextGenerator, complete_with_timeout};
use crate::personalization::PersonalizationFlags;
use crate::session::{Session, SessionPatch, WorkflowState};
use crate::workflow::catalog::TaskCatalog;
use crate::workflow::router::{ActionKind, escalation_due};

/// Daily time used when a schedule request cannot be parsed.
pub const DEFAULT_SCHEDULE: (u32, u32) = (12, 0);

/// Reply when the text generator fails or times out.
pub const QUESTION_FALLBACK: &str =
    "Sorry, I couldn't answer that right now. Please try again in a little while.";

/// What the engine must do after committing a node's patch.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEffect {
    None,
    /// A new task went out; arm its reminders.
    TaskDispatched { issued_at: DateTime<Utc> },
    /// The daily dispatch time changed; re-arm the daily timer.
    ScheduleSet { hour: u32, minute: u32 },
}

/// Result of running one node.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    pub message: String,
    pub patch: SessionPatch,
    pub effect: NodeEffect,
}

impl ActionOutcome {
    fn message_only(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            patch: SessionPatch::new(),
            effect: NodeEffect::None,
        }
    }
}

/// Issue a task from the catalog, unless one is still outstanding.
pub fn dispatch_task(
    session: &Session,
    flags: &PersonalizationFlags,
    catalog: &TaskCatalog,
    now: DateTime<Utc>,
) -> ActionOutcome {
    if session.state() == WorkflowState::AwaitingFeedback {
        let task = session.last_task.as_deref().unwrap_or("your exercise");
        debug!(task, "Refusing dispatch, task still outstanding");
        return ActionOutcome::message_only(format!(
            "You still have an unfinished exercise: {task}. \
             Reply with your feedback when you're done and I'll send the next one."
        ));
    }

    let task = catalog.select().to_string();
    let mut message = format!("Here's your daily exercise: {task}. Let me know when you're done!");

    let goals = session.goals.as_deref().filter(|g| !g.trim().is_empty());
    if let (true, Some(goals)) = (flags.include_goals, goals) {
        message.push_str(&format!(" Remember your goal: {goals}."));
    }
    if flags.warning_tone {
        message.push_str(" Skipping workouts adds up quickly, so don't let a lack of exercise set you back.");
    }

    let patch = SessionPatch::new()
        .last_task(Some(task))
        .feedback(None)
        .reminders_sent(0)
        .task_issued(now, now.date_naive());

    ActionOutcome {
        message,
        patch,
        effect: NodeEffect::TaskDispatched { issued_at: now },
    }
}

/// Nudge the user about the outstanding task.
pub fn send_reminder(
    session: &Session,
    flags: &PersonalizationFlags,
    now: DateTime<Utc>,
) -> ActionOutcome {
    let Some(task) = session.last_task.as_deref() else {
        return ActionOutcome::message_only("No reminder needed. There's no exercise waiting on you.");
    };
    if session.feedback.is_some() {
        return ActionOutcome::message_only("No reminder needed. Feedback already received.");
    }
    if session.reminders_sent >= MAX_REMINDERS {
        return ActionOutcome::message_only("Maximum reminders sent. I'll wait for your feedback.");
    }

    let count = session.reminders_sent + 1;
    let mut message = format!(
        "Reminder {count}/{MAX_REMINDERS}: Don't forget to complete your exercise: {task}. Reply when done!"
    );
    if escalation_due(session, flags, now) {
        let days = session.days_since_task(now).unwrap_or_default();
        message.push_str(&format!(
            " It's been {days} days without a workout. Staying inactive will undo your progress."
        ));
    }

    ActionOutcome {
        message,
        patch: SessionPatch::new().reminders_sent(count),
        effect: NodeEffect::None,
    }
}

/// Acknowledge feedback, or say we're still waiting. Never mutates.
pub fn check_feedback(session: &Session) -> ActionOutcome {
    match session.feedback.as_deref() {
        Some(feedback) => ActionOutcome::message_only(format!(
            "Thanks for your feedback: '{feedback}'. Great job!"
        )),
        None => ActionOutcome::message_only(
            "I'm still waiting for your feedback. Let me know when you've completed the exercise!",
        ),
    }
}

/// Set the daily dispatch time from free text.
pub fn schedule_session(text: &str) -> ActionOutcome {
    let (hour, minute) = parse_time(text).unwrap_or_else(|| {
        debug!(text, "Unparseable schedule time, using default");
        DEFAULT_SCHEDULE
    });
    schedule_at(hour, minute)
}

/// Set the daily dispatch time.
pub fn schedule_at(hour: u32, minute: u32) -> ActionOutcome {
    ActionOutcome {
        message: format!(
            "Session scheduled for {hour:02}:{minute:02}. I'll send your exercise at that time every day."
        ),
        patch: SessionPatch::new().scheduled(hour, minute),
        effect: NodeEffect::ScheduleSet { hour, minute },
    }
}

/// Run one of the state-touching nodes against `session`.
///
/// Returns `None` for `AnswerQuestion`, which never touches state.
pub fn run_stateful(
    action: ActionKind,
    session: &Session,
    flags: &PersonalizationFlags,
    catalog: &TaskCatalog,
    text: &str,
    now: DateTime<Utc>,
) -> Option<ActionOutcome> {
    match action {
        ActionKind::DispatchTask => Some(dispatch_task(session, flags, catalog, now)),
        ActionKind::SendReminder => Some(send_reminder(session, flags, now)),
        ActionKind::CheckFeedback => Some(check_feedback(session)),
        ActionKind::ScheduleSession => Some(schedule_session(text)),
        ActionKind::AnswerQuestion => None,
    }
}

static TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,2})(?::(\d{2}))?\s*(am|pm)?\b").expect("time pattern compiles")
});

/// Find a time of day in `text`: `HH:MM`, `H am/pm` or `H:MM am/pm`.
///
/// Returns 24-hour `(hour, minute)`. A bare number without minutes or a
/// meridiem is not a time.
pub fn parse_time(text: &str) -> Option<(u32, u32)> {
    TIME_RE.captures_iter(text).find_map(|caps| {
        let hour: u32 = caps.get(1)?.as_str().parse().ok()?;
        let minute = caps.get(2).map(|m| m.as_str().parse::<u32>());
        let meridiem = caps.get(3).map(|m| m.as_str().to_lowercase());

        let minute = match minute {
            Some(parsed) => parsed.ok()?,
            None if meridiem.is_some() => 0,
            None => return None,
        };
        if minute > 59 {
            return None;
        }

        let hour = match meridiem.as_deref() {
            Some(m) if (1..=12).contains(&hour) => match (m, hour) {
                ("am", 12) => 0,
                ("am", h) => h,
                ("pm", 12) => 12,
                (_, h) => h + 12,
            },
            Some(_) => return None,
            None if hour < 24 => hour,
            None => return None,
        };
        Some((hour, minute))
    })
}

/// Answer a free-form question. Touches no state.
pub async fn answer_question(
    generator: &dyn TextGenerator,
    question: &str,
    timeout: Duration,
) -> String {
    let prompt = format!("Answer this workout question: {question}");
    match complete_with_timeout(generator, &prompt, timeout).await {
        Ok(answer) => answer,
        Err(e) => {
            warn!(error = %e, "Question answering failed, using fallback");
            QUESTION_FALLBACK.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::personalization::derive_flags;
    use async_trait::async_trait;

    fn outstanding(reminders: u32) -> Session {
        let mut session = Session::default();
        session.apply(
            &SessionPatch::new()
                .last_task(Some("Do 10 push-ups".into()))
                .reminders_sent(reminders),
        );
        session
    }

    fn applied(session: &Session, outcome: &ActionOutcome) -> Session {
        let mut next = session.clone();
        next.apply(&outcome.patch);
        next
    }

    #[test]
    fn dispatch_on_empty_session() {
        let session = Session::default();
        let now = Utc::now();
        let outcome = dispatch_task(&session, &PersonalizationFlags::default(), &TaskCatalog::default(), now);

        assert!(outcome.message.contains("Do 10 push-ups"));
        assert_eq!(outcome.effect, NodeEffect::TaskDispatched { issued_at: now });

        let next = applied(&session, &outcome);
        assert_eq!(next.last_task.as_deref(), Some("Do 10 push-ups"));
        assert_eq!(next.reminders_sent, 0);
        assert_eq!(next.task_issued_at, Some(now));
        assert_eq!(next.task_issued_date, Some(now.date_naive()));
        assert_eq!(next.state(), WorkflowState::AwaitingFeedback);
    }

    #[test]
    fn dispatch_refuses_while_awaiting_feedback() {
        let session = outstanding(2);
        let outcome = dispatch_task(&session, &PersonalizationFlags::default(), &TaskCatalog::default(), Utc::now());

        assert!(outcome.message.contains("unfinished"));
        assert!(outcome.patch.is_empty());
        assert_eq!(outcome.effect, NodeEffect::None);
        assert_eq!(applied(&session, &outcome), session);
    }

    #[test]
    fn dispatch_after_feedback_starts_new_cycle() {
        let mut session = outstanding(3);
        session.apply(&SessionPatch::new().feedback(Some("done".into())));

        let outcome = dispatch_task(&session, &PersonalizationFlags::default(), &TaskCatalog::default(), Utc::now());
        let next = applied(&session, &outcome);
        assert_eq!(next.feedback, None);
        assert_eq!(next.reminders_sent, 0);
    }

    #[test]
    fn dispatch_framing() {
        let mut session = Session::default();
        session.apply(&SessionPatch::new().goals(Some("run a 5k".into())));

        let flags = derive_flags("Remind them of their goal and warn them");
        let outcome = dispatch_task(&session, &flags, &TaskCatalog::default(), Utc::now());
        assert!(outcome.message.contains("Remember your goal: run a 5k."));
        assert!(outcome.message.contains("lack of exercise"));

        // Goal framing needs known goals.
        let outcome = dispatch_task(&Session::default(), &flags, &TaskCatalog::default(), Utc::now());
        assert!(!outcome.message.contains("Remember your goal"));
    }

    #[test]
    fn reminder_increments_and_names_task() {
        let session = outstanding(0);
        let outcome = send_reminder(&session, &PersonalizationFlags::default(), Utc::now());
        assert!(outcome.message.starts_with("Reminder 1/3"));
        assert!(outcome.message.contains("Do 10 push-ups"));
        assert_eq!(applied(&session, &outcome).reminders_sent, 1);
    }

    #[test]
    fn reminder_noops() {
        let flags = PersonalizationFlags::default();
        let now = Utc::now();

        let outcome = send_reminder(&Session::default(), &flags, now);
        assert!(outcome.patch.is_empty());

        let mut done = outstanding(1);
        done.apply(&SessionPatch::new().feedback(Some("done".into())));
        let outcome = send_reminder(&done, &flags, now);
        assert_eq!(outcome.message, "No reminder needed. Feedback already received.");
        assert!(outcome.patch.is_empty());

        let capped = outstanding(3);
        let outcome = send_reminder(&capped, &flags, now);
        assert!(outcome.message.starts_with("Maximum reminders sent"));
        assert_eq!(applied(&capped, &outcome).reminders_sent, 3);
    }

    #[test]
    fn reminder_inactivity_warning() {
        let now = Utc::now();
        let issued = now - chrono::Duration::days(3);
        let mut session = outstanding(1);
        session.apply(&SessionPatch::new().task_issued(issued, issued.date_naive()));

        let outcome = send_reminder(&session, &derive_flags("warn about lack of exercise"), now);
        assert!(outcome.message.contains("3 days without a workout"));

        let outcome = send_reminder(&session, &PersonalizationFlags::default(), now);
        assert!(!outcome.message.contains("without a workout"));
    }

    #[test]
    fn check_feedback_never_mutates() {
        let waiting = outstanding(3);
        let outcome = check_feedback(&waiting);
        assert!(outcome.message.contains("still waiting"));
        assert!(outcome.patch.is_empty());

        let mut done = waiting.clone();
        done.apply(&SessionPatch::new().feedback(Some("felt great".into())));
        let outcome = check_feedback(&done);
        assert_eq!(outcome.message, "Thanks for your feedback: 'felt great'. Great job!");
    }

    #[test]
    fn parse_time_formats() {
        assert_eq!(parse_time("Schedule for 14:00"), Some((14, 0)));
        assert_eq!(parse_time("schedule at 7am"), Some((7, 0)));
        assert_eq!(parse_time("schedule at 7 PM"), Some((19, 0)));
        assert_eq!(parse_time("schedule at 6:30 pm"), Some((18, 30)));
        assert_eq!(parse_time("schedule at 12am"), Some((0, 0)));
        assert_eq!(parse_time("schedule at 12pm"), Some((12, 0)));
        assert_eq!(parse_time("schedule at 09:05"), Some((9, 5)));
    }

    #[test]
    fn parse_time_rejects_garbage() {
        assert_eq!(parse_time("schedule soon"), None);
        assert_eq!(parse_time("schedule at 7"), None);
        assert_eq!(parse_time("schedule at 25:00"), None);
        assert_eq!(parse_time("schedule at 10:75"), None);
        assert_eq!(parse_time("schedule at 13pm"), None);
    }

    #[test]
    fn schedule_defaults_to_noon() {
        let outcome = schedule_session("schedule whenever");
        assert!(outcome.message.contains("12:00"));
        assert_eq!(outcome.effect, NodeEffect::ScheduleSet { hour: 12, minute: 0 });

        let next = applied(&Session::default(), &outcome);
        assert_eq!(next.scheduled_time.as_deref(), Some("12:00"));
        assert_eq!(next.last_task, None);
    }

    struct Canned(Result<String, LlmError>);

    #[async_trait]
    impl TextGenerator for Canned {
        fn model_name(&self) -> &str {
            "canned"
        }

        async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn question_answer_and_fallback() {
        let ok = Canned(Ok("Keep your back straight.".into()));
        let answer = answer_question(&ok, "How do I squat?", Duration::from_secs(1)).await;
        assert_eq!(answer, "Keep your back straight.");

        let failing = Canned(Err(LlmError::RequestFailed {
            provider: "canned".into(),
            reason: "boom".into(),
        }));
        let answer = answer_question(&failing, "How do I squat?", Duration::from_secs(1)).await;
        assert_eq!(answer, QUESTION_FALLBACK);
    }
}
