//! Per-user session state and named field updates.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MAX_REMINDERS;
use crate::personalization::Instruction;

/// Coaching state for one user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub last_task: Option<String>,
    pub task_issued_at: Option<DateTime<Utc>>,
    /// Calendar day of the last dispatch, for once-per-day inference.
    pub task_issued_date: Option<NaiveDate>,
    pub feedback: Option<String>,
    pub reminders_sent: u32,
    pub scheduled_hour: Option<u32>,
    pub scheduled_minute: Option<u32>,
    /// Display form of the daily time, `HH:MM`.
    pub scheduled_time: Option<String>,
    pub goals: Option<String>,
    pub coach_instruction: Option<Instruction>,
    pub last_instruction_fetched_at: Option<DateTime<Utc>>,
}

/// Where a session sits in the task/feedback cycle.
///
/// Derived from the session on demand; never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// No task outstanding.
    AwaitingTask,
    /// Task dispatched, no feedback yet.
    AwaitingFeedback,
    /// Feedback recorded for the current task.
    Completed,
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AwaitingTask => "awaiting_task",
            Self::AwaitingFeedback => "awaiting_feedback",
            Self::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

impl Session {
    pub fn state(&self) -> WorkflowState {
        match (&self.last_task, &self.feedback) {
            (None, _) => WorkflowState::AwaitingTask,
            (Some(_), None) => WorkflowState::AwaitingFeedback,
            (Some(_), Some(_)) => WorkflowState::Completed,
        }
    }

    /// Whether a task was dispatched on `today`.
    pub fn issued_on(&self, today: NaiveDate) -> bool {
        self.task_issued_date == Some(today)
    }

    /// Whole days elapsed since the current task was issued.
    pub fn days_since_task(&self, now: DateTime<Utc>) -> Option<i64> {
        self.task_issued_at
            .map(|issued| now.signed_duration_since(issued).num_days())
    }

    /// Whether this session holds nothing worth reporting.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merge a patch field by field, then restore the session invariants.
    pub fn apply(&mut self, patch: &SessionPatch) {
        for field in &patch.fields {
            match field.clone() {
                SessionField::LastTask(v) => self.last_task = v,
                SessionField::TaskIssuedAt(v) => self.task_issued_at = v,
                SessionField::TaskIssuedDate(v) => self.task_issued_date = v,
                SessionField::Feedback(v) => self.feedback = v,
                SessionField::RemindersSent(v) => self.reminders_sent = v,
                SessionField::ScheduledHour(v) => self.scheduled_hour = v,
                SessionField::ScheduledMinute(v) => self.scheduled_minute = v,
                SessionField::ScheduledTime(v) => self.scheduled_time = v,
                SessionField::Goals(v) => self.goals = v,
                SessionField::CoachInstruction(v) => self.coach_instruction = v,
                SessionField::LastInstructionFetchedAt(v) => self.last_instruction_fetched_at = v,
            }
        }

        self.reminders_sent = self.reminders_sent.min(MAX_REMINDERS);
        if self.last_task.is_none() {
            self.reminders_sent = 0;
            self.feedback = None;
        }
    }
}

/// One named field write. `None` clears the field.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionField {
    LastTask(Option<String>),
    TaskIssuedAt(Option<DateTime<Utc>>),
    TaskIssuedDate(Option<NaiveDate>),
    Feedback(Option<String>),
    RemindersSent(u32),
    ScheduledHour(Option<u32>),
    ScheduledMinute(Option<u32>),
    ScheduledTime(Option<String>),
    Goals(Option<String>),
    CoachInstruction(Option<Instruction>),
    LastInstructionFetchedAt(Option<DateTime<Utc>>),
}

/// An ordered set of field writes, applied last-writer-wins per field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPatch {
    pub fields: Vec<SessionField>,
}

impl SessionPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn with(mut self, field: SessionField) -> Self {
        self.fields.push(field);
        self
    }

    pub fn last_task(self, task: Option<String>) -> Self {
        self.with(SessionField::LastTask(task))
    }

    pub fn task_issued(self, at: DateTime<Utc>, date: NaiveDate) -> Self {
        self.with(SessionField::TaskIssuedAt(Some(at)))
            .with(SessionField::TaskIssuedDate(Some(date)))
    }

    pub fn feedback(self, feedback: Option<String>) -> Self {
        self.with(SessionField::Feedback(feedback))
    }

    pub fn reminders_sent(self, count: u32) -> Self {
        self.with(SessionField::RemindersSent(count))
    }

    pub fn scheduled(self, hour: u32, minute: u32) -> Self {
        self.with(SessionField::ScheduledHour(Some(hour)))
            .with(SessionField::ScheduledMinute(Some(minute)))
            .with(SessionField::ScheduledTime(Some(format!("{hour:02}:{minute:02}"))))
    }

    pub fn unscheduled(self) -> Self {
        self.with(SessionField::ScheduledHour(None))
            .with(SessionField::ScheduledMinute(None))
            .with(SessionField::ScheduledTime(None))
    }

    pub fn goals(self, goals: Option<String>) -> Self {
        self.with(SessionField::Goals(goals))
    }

    pub fn instruction(self, instruction: Instruction, fetched_at: DateTime<Utc>) -> Self {
        self.with(SessionField::CoachInstruction(Some(instruction)))
            .with(SessionField::LastInstructionFetchedAt(Some(fetched_at)))
    }
}
