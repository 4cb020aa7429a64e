//! Reminder scheduler: per-user daily dispatch and escalating reminder timers.
//!
//! Each timer is a spawned task that sleeps until its fire time and then
//! emits a `SchedulerTick` on a channel. The scheduler never calls the engine
//! directly; the engine's tick dispatcher consumes the channel and re-runs the
//! router for the user, whose own state checks make a stale tick harmless.
//!
//! Per user there is at most one daily timer and at most `MAX_REMINDERS`
//! reminder timers. Arming replaces the previous timers of that kind under a
//! single registry lock.

pub mod daily;

pub use daily::{daily_expression, next_daily_fire};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::workflow::policy::ReminderPolicy;

/// Buffered ticks before timer tasks start waiting on the dispatcher.
pub const TICK_CHANNEL_CAPACITY: usize = 256;

/// Kind of timer. A user has at most one job per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Daily,
    /// Reminder with its 1-based sequence number.
    Reminder(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct JobKey {
    user_id: String,
    kind: JobKind,
}

impl JobKey {
    fn new(user_id: &str, kind: JobKind) -> Self {
        Self {
            user_id: user_id.to_string(),
            kind,
        }
    }
}

struct ScheduledJob {
    /// Distinguishes this job from a later one under the same key.
    id: Uuid,
    coach_id: String,
    fire_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

type Registry = Arc<Mutex<HashMap<JobKey, ScheduledJob>>>;

/// Emitted when a timer fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerTick {
    pub user_id: String,
    pub coach_id: String,
    pub kind: JobKind,
    pub fired_at: DateTime<Utc>,
}

/// An armed reminder, for introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReminderJob {
    pub user_id: String,
    pub sequence_number: u32,
    pub fire_at: DateTime<Utc>,
}

/// The armed daily dispatch timer, for introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyJob {
    pub user_id: String,
    pub coach_id: String,
    pub next_fire: DateTime<Utc>,
}

/// Owns every timer in the process.
pub struct ReminderScheduler {
    policy: ReminderPolicy,
    jobs: Registry,
    tick_tx: mpsc::Sender<SchedulerTick>,
}

impl ReminderScheduler {
    /// Create a scheduler and the receiving end of its tick channel.
    pub fn new(policy: ReminderPolicy) -> (Self, mpsc::Receiver<SchedulerTick>) {
        let (tick_tx, tick_rx) = mpsc::channel(TICK_CHANNEL_CAPACITY);
        let scheduler = Self {
            policy,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            tick_tx,
        };
        (scheduler, tick_rx)
    }

    pub fn policy(&self) -> &ReminderPolicy {
        &self.policy
    }

    /// Replace the user's reminder timers with a fresh set for a task
    /// dispatched at `issued_at`. Returns the number of timers armed.
    pub fn arm_reminders(&self, user_id: &str, coach_id: &str, issued_at: DateTime<Utc>) -> usize {
        let schedule = self.policy.schedule_from(issued_at);

        let mut jobs = self.lock();
        let cancelled = remove_reminders(&mut jobs, user_id);
        if cancelled > 0 {
            debug!(user_id = %user_id, cancelled, "Replacing reminder timers");
        }

        for (sequence, fire_at) in &schedule {
            let key = JobKey::new(user_id, JobKind::Reminder(*sequence));
            let id = Uuid::new_v4();
            let handle = tokio::spawn(run_reminder(
                self.jobs.clone(),
                self.tick_tx.clone(),
                key.clone(),
                id,
                coach_id.to_string(),
                *fire_at,
            ));
            jobs.insert(
                key,
                ScheduledJob {
                    id,
                    coach_id: coach_id.to_string(),
                    fire_at: *fire_at,
                    handle,
                },
            );
        }

        info!(user_id = %user_id, count = schedule.len(), "Armed reminder timers");
        schedule.len()
    }

    /// Replace the user's daily dispatch timer. Returns the first fire time.
    pub fn arm_daily(
        &self,
        user_id: &str,
        coach_id: &str,
        hour: u32,
        minute: u32,
    ) -> Result<DateTime<Utc>, SchedulerError> {
        let first_fire = next_daily_fire(hour, minute, Utc::now())?.ok_or_else(|| {
            SchedulerError::NoUpcomingFire {
                user_id: user_id.to_string(),
            }
        })?;

        let key = JobKey::new(user_id, JobKind::Daily);
        let id = Uuid::new_v4();

        let mut jobs = self.lock();
        if let Some(previous) = jobs.remove(&key) {
            previous.handle.abort();
            debug!(user_id = %user_id, "Replaced daily timer");
        }
        let handle = tokio::spawn(run_daily(
            self.jobs.clone(),
            self.tick_tx.clone(),
            key.clone(),
            id,
            coach_id.to_string(),
            hour,
            minute,
            first_fire,
        ));
        jobs.insert(
            key,
            ScheduledJob {
                id,
                coach_id: coach_id.to_string(),
                fire_at: first_fire,
                handle,
            },
        );

        info!(
            user_id = %user_id,
            time = %format!("{hour:02}:{minute:02}"),
            next_fire = %first_fire,
            "Armed daily timer"
        );
        Ok(first_fire)
    }

    /// Cancel every pending reminder for a user. Returns how many were armed.
    pub fn cancel_reminders(&self, user_id: &str) -> usize {
        let cancelled = remove_reminders(&mut self.lock(), user_id);
        if cancelled > 0 {
            info!(user_id = %user_id, cancelled, "Cancelled reminder timers");
        }
        cancelled
    }

    /// Cancel the user's daily timer. Returns whether one was armed.
    pub fn cancel_daily(&self, user_id: &str) -> bool {
        match self.lock().remove(&JobKey::new(user_id, JobKind::Daily)) {
            Some(job) => {
                job.handle.abort();
                info!(user_id = %user_id, "Cancelled daily timer");
                true
            }
            None => false,
        }
    }

    /// Cancel every timer for a user.
    pub fn cancel_all(&self, user_id: &str) {
        self.cancel_reminders(user_id);
        self.cancel_daily(user_id);
    }

    /// Armed reminders for a user, in sequence order.
    pub fn pending_reminders(&self, user_id: &str) -> Vec<ReminderJob> {
        let jobs = self.lock();
        let mut pending: Vec<ReminderJob> = jobs
            .iter()
            .filter_map(|(key, job)| match key.kind {
                JobKind::Reminder(sequence_number) if key.user_id == user_id => Some(ReminderJob {
                    user_id: user_id.to_string(),
                    sequence_number,
                    fire_at: job.fire_at,
                }),
                _ => None,
            })
            .collect();
        pending.sort_by_key(|job| job.sequence_number);
        pending
    }

    /// The user's daily timer, if armed.
    pub fn daily_job(&self, user_id: &str) -> Option<DailyJob> {
        self.lock()
            .get(&JobKey::new(user_id, JobKind::Daily))
            .map(|job| DailyJob {
                user_id: user_id.to_string(),
                coach_id: job.coach_id.clone(),
                next_fire: job.fire_at,
            })
    }

    /// Abort every timer. Used on shutdown.
    pub fn shutdown(&self) {
        let mut jobs = self.lock();
        let count = jobs.len();
        for (_, job) in jobs.drain() {
            job.handle.abort();
        }
        info!(count, "Scheduler stopped");
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobKey, ScheduledJob>> {
        lock_registry(&self.jobs)
    }
}

fn lock_registry(jobs: &Registry) -> MutexGuard<'_, HashMap<JobKey, ScheduledJob>> {
    // Timer bookkeeping stays usable even if a holder panicked.
    jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn remove_reminders(jobs: &mut HashMap<JobKey, ScheduledJob>, user_id: &str) -> usize {
    let keys: Vec<JobKey> = jobs
        .keys()
        .filter(|key| key.user_id == user_id && matches!(key.kind, JobKind::Reminder(_)))
        .cloned()
        .collect();
    for key in &keys {
        if let Some(job) = jobs.remove(key) {
            job.handle.abort();
        }
    }
    keys.len()
}

/// Remove `key` only if it still belongs to job `id`.
fn unregister(jobs: &Registry, key: &JobKey, id: Uuid) {
    let mut jobs = lock_registry(jobs);
    if jobs.get(key).is_some_and(|job| job.id == id) {
        jobs.remove(key);
    }
}

fn delay_until(fire_at: DateTime<Utc>) -> Duration {
    (fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

async fn emit(tick_tx: &mpsc::Sender<SchedulerTick>, tick: SchedulerTick) {
    let user_id = tick.user_id.clone();
    if tick_tx.send(tick).await.is_err() {
        warn!(user_id = %user_id, "Tick dropped, dispatcher is gone");
    }
}

async fn run_reminder(
    jobs: Registry,
    tick_tx: mpsc::Sender<SchedulerTick>,
    key: JobKey,
    id: Uuid,
    coach_id: String,
    fire_at: DateTime<Utc>,
) {
    tokio::time::sleep(delay_until(fire_at)).await;

    // Unregister first so introspection never lists a fired reminder.
    unregister(&jobs, &key, id);
    debug!(user_id = %key.user_id, kind = ?key.kind, "Reminder timer fired");

    let tick = SchedulerTick {
        user_id: key.user_id,
        coach_id,
        kind: key.kind,
        fired_at: Utc::now(),
    };
    emit(&tick_tx, tick).await;
}

#[allow(clippy::too_many_arguments)]
async fn run_daily(
    jobs: Registry,
    tick_tx: mpsc::Sender<SchedulerTick>,
    key: JobKey,
    id: Uuid,
    coach_id: String,
    hour: u32,
    minute: u32,
    first_fire: DateTime<Utc>,
) {
    let mut next = first_fire;
    loop {
        tokio::time::sleep(delay_until(next)).await;
        debug!(user_id = %key.user_id, "Daily timer fired");

        emit(
            &tick_tx,
            SchedulerTick {
                user_id: key.user_id.clone(),
                coach_id: coach_id.clone(),
                kind: JobKind::Daily,
                fired_at: Utc::now(),
            },
        )
        .await;

        let after = next.max(Utc::now());
        next = match next_daily_fire(hour, minute, after) {
            Ok(Some(fire)) => fire,
            Ok(None) => {
                warn!(user_id = %key.user_id, "Daily schedule has no further fire time");
                unregister(&jobs, &key, id);
                return;
            }
            Err(e) => {
                warn!(user_id = %key.user_id, error = %e, "Daily timer stopped");
                unregister(&jobs, &key, id);
                return;
            }
        };

        let still_armed = {
            let mut registry = lock_registry(&jobs);
            match registry.get_mut(&key) {
                Some(job) if job.id == id => {
                    job.fire_at = next;
                    true
                }
                _ => false,
            }
        };
        // Replaced or cancelled while firing.
        if !still_armed {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER: &str = "user-1";
    const COACH: &str = "coach123";

    fn scheduler() -> (ReminderScheduler, mpsc::Receiver<SchedulerTick>) {
        ReminderScheduler::new(ReminderPolicy::default())
    }

    #[tokio::test(start_paused = true)]
    async fn arms_three_reminders_at_offsets() {
        let (scheduler, _rx) = scheduler();
        let t0 = Utc::now();

        assert_eq!(scheduler.arm_reminders(USER, COACH, t0), 3);

        let pending = scheduler.pending_reminders(USER);
        let sequences: Vec<u32> = pending.iter().map(|j| j.sequence_number).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(pending[0].fire_at, t0 + chrono::Duration::hours(2));
        assert_eq!(pending[2].fire_at, t0 + chrono::Duration::hours(6));
    }

    #[tokio::test(start_paused = true)]
    async fn reminders_fire_in_order() {
        let (scheduler, mut rx) = scheduler();
        scheduler.arm_reminders(USER, COACH, Utc::now());

        let first = rx.recv().await.unwrap();
        assert_eq!(first.user_id, USER);
        assert_eq!(first.coach_id, COACH);
        assert_eq!(first.kind, JobKind::Reminder(1));
        assert_eq!(scheduler.pending_reminders(USER).len(), 2);

        assert_eq!(rx.recv().await.unwrap().kind, JobKind::Reminder(2));
        assert_eq!(rx.recv().await.unwrap().kind, JobKind::Reminder(3));
        assert!(scheduler.pending_reminders(USER).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_reminders_never_fire() {
        let (scheduler, mut rx) = scheduler();
        scheduler.arm_reminders(USER, COACH, Utc::now());

        assert_eq!(scheduler.cancel_reminders(USER), 3);
        assert!(scheduler.pending_reminders(USER).is_empty());

        let tick = tokio::time::timeout(Duration::from_secs(8 * 3600), rx.recv()).await;
        assert!(tick.is_err(), "no tick expected after cancellation");
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_reminders() {
        let (scheduler, _rx) = scheduler();
        let t0 = Utc::now();
        scheduler.arm_reminders(USER, COACH, t0);
        let t1 = t0 + chrono::Duration::minutes(10);
        scheduler.arm_reminders(USER, COACH, t1);

        let pending = scheduler.pending_reminders(USER);
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].fire_at, t1 + chrono::Duration::hours(2));
    }

    #[tokio::test(start_paused = true)]
    async fn one_daily_timer_per_user() {
        let (scheduler, _rx) = scheduler();
        scheduler.arm_daily(USER, COACH, 9, 0).unwrap();
        let second = scheduler.arm_daily(USER, COACH, 14, 0).unwrap();

        let job = scheduler.daily_job(USER).unwrap();
        assert_eq!(job.next_fire, second);
        assert_eq!(scheduler.lock().len(), 1);

        assert!(scheduler.cancel_daily(USER));
        assert!(scheduler.daily_job(USER).is_none());
        assert!(!scheduler.cancel_daily(USER));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_daily_time_arms_nothing() {
        let (scheduler, _rx) = scheduler();
        let result = scheduler.arm_daily(USER, COACH, 25, 0);
        assert!(matches!(result, Err(SchedulerError::InvalidTime { .. })));
        assert!(scheduler.daily_job(USER).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_leaves_other_users_alone() {
        let (scheduler, _rx) = scheduler();
        scheduler.arm_reminders(USER, COACH, Utc::now());
        scheduler.arm_daily(USER, COACH, 8, 0).unwrap();
        scheduler.arm_reminders("user-2", COACH, Utc::now());

        scheduler.cancel_all(USER);

        assert!(scheduler.pending_reminders(USER).is_empty());
        assert!(scheduler.daily_job(USER).is_none());
        assert_eq!(scheduler.pending_reminders("user-2").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn reminders_past_due_fire_immediately() {
        let (scheduler, mut rx) = scheduler();
        scheduler.arm_reminders(USER, COACH, Utc::now() - chrono::Duration::hours(3));

        let tick = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert_eq!(tick.unwrap().unwrap().kind, JobKind::Reminder(1));
    }
}
