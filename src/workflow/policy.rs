//! When reminders are due.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::MAX_REMINDERS;
use crate::session::{Session, WorkflowState};

/// Slack allowed between a timer firing and the wall-clock due time.
pub const DUE_GRACE: Duration = Duration::from_secs(30);

/// Reminder timing: one offset per reminder, measured from dispatch.
#[derive(Debug, Clone)]
pub struct ReminderPolicy {
    offsets: Vec<Duration>,
    grace: Duration,
}

impl ReminderPolicy {
    pub fn new(offsets: Vec<Duration>) -> Self {
        Self {
            offsets,
            grace: DUE_GRACE,
        }
    }

    /// Offset of the reminder that follows `reminders_sent` earlier ones.
    ///
    /// Reminders past the end of a short offset list reuse the last offset.
    pub fn offset(&self, reminders_sent: u32) -> Option<Duration> {
        if reminders_sent >= MAX_REMINDERS {
            return None;
        }
        self.offsets
            .get(reminders_sent as usize)
            .or_else(|| self.offsets.last())
            .copied()
    }

    /// Fire times for every reminder of a task issued at `issued_at`,
    /// as `(sequence_number, fire_at)` with sequence numbers starting at 1.
    pub fn schedule_from(&self, issued_at: DateTime<Utc>) -> Vec<(u32, DateTime<Utc>)> {
        (0..MAX_REMINDERS)
            .filter_map(|sent| {
                let offset = self.offset(sent)?;
                let offset = chrono::Duration::from_std(offset).ok()?;
                Some((sent + 1, issued_at + offset))
            })
            .collect()
    }

    /// Whether the next reminder for this session is due at `now`.
    ///
    /// A task with no issue timestamp counts as due.
    pub fn is_due(&self, session: &Session, now: DateTime<Utc>) -> bool {
        if session.state() != WorkflowState::AwaitingFeedback {
            return false;
        }
        let Some(offset) = self.offset(session.reminders_sent) else {
            return false;
        };
        let Some(issued_at) = session.task_issued_at else {
            return true;
        };
        let due_at = issued_at + chrono::Duration::from_std(offset).unwrap_or(chrono::Duration::zero());
        let grace = chrono::Duration::from_std(self.grace).unwrap_or(chrono::Duration::zero());
        now + grace >= due_at
    }
}

impl Default for ReminderPolicy {
    fn default() -> Self {
        Self::new(vec![
            Duration::from_secs(2 * 3600),
            Duration::from_secs(4 * 3600),
            Duration::from_secs(6 * 3600),
        ])
    }
}
